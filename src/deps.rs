//! Foreign-key dependency resolution (dump order).
//!
//! Kahn's algorithm over the child→parent adjacency from the schema
//! descriptor. Output: parents before children. Tables with no relative
//! constraint come out alphabetically so the order is deterministic.
//!
//! Cycles are never silently mis-ordered:
//! - self-references are stripped up front and reported as deferred edges
//!   (whole-row load with deferred constraints makes them safe);
//! - any remaining cycle raises CyclicDependencyError naming the tables.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::CyclicDependencyError;
use crate::schema::SchemaDescriptor;

/// Result of dependency resolution.
#[derive(Debug, Clone)]
pub struct DumpOrder {
    /// Topological order, parents first.
    pub tables: Vec<String>,
    /// Edges (table, referenced_table) excluded from ordering; constraint
    /// enforcement for these must be deferred during load.
    pub deferred: Vec<(String, String)>,
}

impl DumpOrder {
    pub fn reversed(&self) -> Vec<String> {
        self.tables.iter().rev().cloned().collect()
    }
}

/// Resolve dump order for the whole schema.
pub fn resolve(schema: &SchemaDescriptor) -> Result<DumpOrder> {
    let names: BTreeSet<String> = schema.tables.iter().map(|t| t.name.clone()).collect();

    // child -> set of parents (edges into tables we actually manage;
    // references to external tables do not constrain the order).
    let mut parents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut deferred = Vec::new();
    for t in &schema.tables {
        let entry = parents.entry(t.name.clone()).or_default();
        for fk in &t.foreign_keys {
            if fk.references_table == t.name {
                deferred.push((t.name.clone(), fk.references_table.clone()));
                continue;
            }
            if names.contains(&fk.references_table) {
                entry.insert(fk.references_table.clone());
            }
        }
    }

    // parent -> children, for O(E) in-degree updates.
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (child, ps) in &parents {
        for p in ps {
            children.entry(p.clone()).or_default().push(child.clone());
        }
    }

    // BTreeSet ready-queue: always pops the alphabetically smallest table.
    let mut ready: BTreeSet<String> = parents
        .iter()
        .filter(|(_, ps)| ps.is_empty())
        .map(|(n, _)| n.clone())
        .collect();
    let mut pending: BTreeMap<String, usize> = parents
        .iter()
        .filter(|(_, ps)| !ps.is_empty())
        .map(|(n, ps)| (n.clone(), ps.len()))
        .collect();

    let mut order = Vec::with_capacity(names.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        order.push(next.clone());
        if let Some(cs) = children.get(&next) {
            for c in cs {
                if let Some(deg) = pending.get_mut(c) {
                    *deg -= 1;
                    if *deg == 0 {
                        pending.remove(c);
                        ready.insert(c.clone());
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        let mut tables: Vec<String> = pending.into_keys().collect();
        tables.sort();
        return Err(CyclicDependencyError { tables }.into());
    }

    Ok(DumpOrder {
        tables: order,
        deferred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForeignKey, TableSpec};

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

    #[test]
    fn unconstrained_tables_come_out_alphabetically() {
        let schema = SchemaDescriptor::new(vec![
            spec("zebra", &[]),
            spec("apple", &[]),
            spec("mango", &[]),
        ]);
        let order = resolve(&schema).unwrap();
        assert_eq!(order.tables, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn self_reference_is_deferred_not_cyclic() {
        let schema = SchemaDescriptor::new(vec![spec("employee", &["employee"])]);
        let order = resolve(&schema).unwrap();
        assert_eq!(order.tables, vec!["employee"]);
        assert_eq!(
            order.deferred,
            vec![("employee".to_string(), "employee".to_string())]
        );
    }

    #[test]
    fn mutual_cycle_names_both_tables() {
        let schema = SchemaDescriptor::new(vec![spec("a", &["b"]), spec("b", &["a"])]);
        let err = resolve(&schema).unwrap_err();
        let cyc = err
            .downcast_ref::<crate::errors::CyclicDependencyError>()
            .expect("cyclic error");
        assert_eq!(cyc.tables, vec!["a", "b"]);
    }
}
