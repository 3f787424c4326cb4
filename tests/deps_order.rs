// tests/deps_order.rs
//
// Run only this file:
//   cargo test --test deps_order -- --nocapture
//
// Covers dump-order resolution over richer graphs than the unit tests:
// diamonds, multi-level chains mixed with unconstrained tables, subset
// dependency checks, and external (unmanaged) references.

use anyhow::Result;

use snapvault::deps::{self, DumpOrder};
use snapvault::errors::CyclicDependencyError;
use snapvault::schema::{ForeignKey, SchemaDescriptor, TableSpec};

fn spec(name: &str, refs: &[&str]) -> TableSpec {
    TableSpec {
        name: name.to_string(),
        foreign_keys: refs
            .iter()
            .map(|r| ForeignKey {
                column: format!("{r}_id"),
                references_table: r.to_string(),
            })
            .collect(),
    }
}

fn pos(order: &DumpOrder, name: &str) -> usize {
    order
        .tables
        .iter()
        .position(|t| t == name)
        .unwrap_or_else(|| panic!("{name} missing from order {:?}", order.tables))
}

#[test]
fn diamond_orders_parents_before_children() -> Result<()> {
    // user <- (invoice, shipment) <- audit
    let schema = SchemaDescriptor::new(vec![
        spec("audit", &["invoice", "shipment"]),
        spec("invoice", &["user"]),
        spec("shipment", &["user"]),
        spec("user", &[]),
    ]);
    let order = deps::resolve(&schema)?;
    assert_eq!(order.tables.len(), 4);
    assert!(pos(&order, "user") < pos(&order, "invoice"));
    assert!(pos(&order, "user") < pos(&order, "shipment"));
    assert!(pos(&order, "invoice") < pos(&order, "audit"));
    assert!(pos(&order, "shipment") < pos(&order, "audit"));
    // Same depth resolves alphabetically, so the whole order is stable.
    assert!(pos(&order, "invoice") < pos(&order, "shipment"));
    assert!(order.deferred.is_empty());
    Ok(())
}

#[test]
fn chain_and_unconstrained_tables_interleave_deterministically() -> Result<()> {
    let schema = SchemaDescriptor::new(vec![
        spec("c", &["b"]),
        spec("b", &["a"]),
        spec("a", &[]),
        spec("zeta", &[]),
        spec("alpha", &[]),
    ]);
    let order = deps::resolve(&schema)?;
    // Ready tables pop alphabetically: a, alpha, b (freed by a), c, zeta.
    assert_eq!(order.tables, vec!["a", "alpha", "b", "c", "zeta"]);
    assert_eq!(order.reversed(), vec!["zeta", "c", "b", "alpha", "a"]);
    Ok(())
}

#[test]
fn references_to_unmanaged_tables_do_not_constrain() -> Result<()> {
    // "event" points at a table the schema does not manage; the engine
    // must not wait for it.
    let schema = SchemaDescriptor::new(vec![spec("event", &["external_ledger"])]);
    let order = deps::resolve(&schema)?;
    assert_eq!(order.tables, vec!["event"]);
    Ok(())
}

#[test]
fn three_table_cycle_names_every_member() -> Result<()> {
    let schema = SchemaDescriptor::new(vec![
        spec("x", &["z"]),
        spec("y", &["x"]),
        spec("z", &["y"]),
        spec("standalone", &[]),
    ]);
    let err = deps::resolve(&schema).unwrap_err();
    let cyc = err
        .downcast_ref::<CyclicDependencyError>()
        .expect("cyclic error");
    assert_eq!(cyc.tables, vec!["x", "y", "z"]);
    Ok(())
}

#[test]
fn self_reference_coexists_with_real_edges() -> Result<()> {
    // "employee" manages itself (manager_id) and belongs to a department.
    let schema = SchemaDescriptor::new(vec![
        spec("employee", &["employee", "department"]),
        spec("department", &[]),
    ]);
    let order = deps::resolve(&schema)?;
    assert_eq!(order.tables, vec!["department", "employee"]);
    assert_eq!(
        order.deferred,
        vec![("employee".to_string(), "employee".to_string())]
    );
    Ok(())
}

#[test]
fn out_of_set_dependents_are_reported_for_subsets() {
    let schema = SchemaDescriptor::new(vec![
        spec("customer", &[]),
        spec("order", &["customer"]),
        spec("order_item", &["order"]),
    ]);
    // Restoring only "customer" leaves "order" rows pointing into the
    // truncated table.
    let conflicts = schema.out_of_set_dependents(&["customer".to_string()]);
    assert_eq!(
        conflicts,
        vec![("order".to_string(), "customer".to_string())]
    );
    // A closed subset has no conflicts.
    let closed: Vec<String> = vec!["customer".into(), "order".into(), "order_item".into()];
    assert!(schema.out_of_set_dependents(&closed).is_empty());
}
