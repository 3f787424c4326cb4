// tests/backup_verify.rs
//
// Run only this file:
//   cargo test --test backup_verify -- --nocapture
//
// Covers:
// 1) Vault backup: manifest in dump order, counts, aggregate checksum.
// 2) verify_snapshot: clean pass, flipped byte names the member, truncation
//    is structural, unknown id is a validation error.
// 3) Media files are walked, recorded and verified.
// 4) delete_snapshot and listing; a busy vault rejects a second backup.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use snapvault::errors::{AlreadyInProgressError, ChecksumMismatchError, ValidationError};
use snapvault::lock::try_acquire_exclusive_lock;
use snapvault::memory::MemoryStore;
use snapvault::schema::{ForeignKey, SchemaDescriptor, TableSpec};
use snapvault::snapshot::{archive_path, BackupOptions, SnapshotReader};
use snapvault::value::Value;
use snapvault::vault::Vault;
use snapvault::VaultConfig;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    // Piggyback test logging on the fixture every test starts with.
    let _ = env_logger::builder().is_test(true).try_init();
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("svtest-backup-{prefix}-{pid}-{t}-{id}"))
}

fn fk(column: &str, table: &str) -> ForeignKey {
    ForeignKey {
        column: column.to_string(),
        references_table: table.to_string(),
    }
}

// Declared out of dependency order on purpose; the engine must not care.
fn shop_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(vec![
        TableSpec {
            name: "order_item".to_string(),
            foreign_keys: vec![fk("order_id", "order")],
        },
        TableSpec {
            name: "customer".to_string(),
            foreign_keys: Vec::new(),
        },
        TableSpec {
            name: "order".to_string(),
            foreign_keys: vec![fk("customer_id", "customer")],
        },
    ])
}

fn seeded_store(schema: &SchemaDescriptor) -> Result<MemoryStore> {
    let mut store = MemoryStore::new(schema.clone());
    store.define_columns("customer", &["id", "name"]);
    store.define_columns("order", &["id", "customer_id"]);
    store.define_columns("order_item", &["id", "order_id", "qty"]);
    for i in 0..5i64 {
        store.insert(
            "customer",
            vec![Value::Int(i), Value::Text(format!("customer-{i}"))],
        )?;
    }
    for i in 0..8i64 {
        store.insert("order", vec![Value::Int(i), Value::Int(i % 5)])?;
    }
    for i in 0..20i64 {
        store.insert(
            "order_item",
            vec![Value::Int(i), Value::Int(i % 8), Value::Int(1 + i % 3)],
        )?;
    }
    Ok(store)
}

fn open_vault(root: &std::path::Path, cfg: VaultConfig) -> Result<Vault> {
    let schema = shop_schema();
    let store = seeded_store(&schema)?;
    Vault::open(root, cfg, schema, Box::new(store))
}

#[test]
fn backup_commits_manifest_in_dump_order() -> Result<()> {
    let root = unique_root("order");
    let vault = open_vault(&root, VaultConfig::default())?;

    let id = vault.create_snapshot(BackupOptions::default())?;
    let manifest = vault.wait_backup(&id)?;
    assert_eq!(manifest.snapshot_id, id);

    let names: Vec<&str> = manifest
        .table_list
        .iter()
        .map(|t| t.table_name.as_str())
        .collect();
    assert_eq!(names, vec!["customer", "order", "order_item"]);
    let counts: Vec<u64> = manifest.table_list.iter().map(|t| t.record_count).collect();
    assert_eq!(counts, vec![5, 8, 20]);
    assert_eq!(manifest.total_record_count, 33);
    assert!(manifest.total_byte_size > 0);
    assert_eq!(manifest.checksum.len(), 64);
    assert!(archive_path(&root, &id).exists());

    let status = vault.backup_status(&id).expect("job known");
    assert_eq!(status.percent, 100);

    let report = vault.verify_snapshot(&id)?;
    assert!(report.valid, "fresh snapshot must verify: {:?}", report.details);
    Ok(())
}

#[test]
fn exclude_tables_drops_only_named_tables() -> Result<()> {
    let root = unique_root("exclude");
    let vault = open_vault(&root, VaultConfig::default())?;

    let id = vault.create_snapshot(BackupOptions {
        exclude_tables: vec!["order_item".to_string()],
        ..Default::default()
    })?;
    let manifest = vault.wait_backup(&id)?;
    let names: Vec<&str> = manifest
        .table_list
        .iter()
        .map(|t| t.table_name.as_str())
        .collect();
    assert_eq!(names, vec!["customer", "order"]);

    // Unknown table names in the exclusion list are caller bugs.
    let id2 = vault.create_snapshot(BackupOptions {
        exclude_tables: vec!["no_such_table".to_string()],
        ..Default::default()
    })?;
    let err = vault.wait_backup(&id2).unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());
    Ok(())
}

#[test]
fn flipped_byte_names_the_member_in_verification() -> Result<()> {
    let root = unique_root("flip");
    let vault = open_vault(&root, VaultConfig::default())?;
    let id = vault.create_snapshot(BackupOptions::default())?;
    vault.wait_backup(&id)?;

    // First payload byte of the first member (tables/customer.dat):
    // header(12) + "SMBR"(4) + name_len(2) + name + chunk_len(4).
    let member = "tables/customer.dat";
    let offset = 12 + 4 + 2 + member.len() + 4;
    let path = archive_path(&root, &id);
    let mut bytes = fs::read(&path)?;
    bytes[offset + 2] ^= 0xFF;
    fs::write(&path, &bytes)?;

    let report = vault.verify_snapshot(&id)?;
    assert!(!report.valid);
    assert!(
        report.details.iter().any(|d| d.contains(member)),
        "details must name the member: {:?}",
        report.details
    );

    // The restore-precondition path classifies the same damage as a
    // checksum mismatch on that member.
    let reader = SnapshotReader::open(&root, &id)?;
    let err = reader.validate().unwrap_err();
    let mismatch = err
        .downcast_ref::<ChecksumMismatchError>()
        .expect("checksum mismatch");
    assert_eq!(mismatch.member, member);

    // Verification is read-only: a second run sees the same result.
    let again = vault.verify_snapshot(&id)?;
    assert_eq!(again.valid, report.valid);
    assert_eq!(again.details, report.details);
    Ok(())
}

#[test]
fn bytes_lost_inside_a_member_name_that_member() -> Result<()> {
    let root = unique_root("midcut");
    let vault = open_vault(&root, VaultConfig::default())?;
    let id = vault.create_snapshot(BackupOptions::default())?;
    vault.wait_backup(&id)?;

    // Cut the last 10 bytes of tables/order.dat (a non-final member): the
    // 10 bytes right before the next member's header, which holds the
    // order_item name.
    let path = archive_path(&root, &id);
    let mut bytes = fs::read(&path)?;
    let needle = b"tables/order_item.dat";
    let name_at = find_subslice(&bytes, needle).expect("member name present");
    let header_at = name_at - 4 - 2; // member magic + name_len
    bytes.drain(header_at - 10..header_at);
    fs::write(&path, &bytes)?;

    let report = vault.verify_snapshot(&id)?;
    assert!(!report.valid);
    assert!(
        report.details.iter().any(|d| d.contains("tables/order.dat")),
        "damage must be attributed to the damaged member: {:?}",
        report.details
    );
    Ok(())
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

#[test]
fn truncated_archive_reports_structural_damage() -> Result<()> {
    let root = unique_root("trunc");
    let vault = open_vault(&root, VaultConfig::default())?;
    let id = vault.create_snapshot(BackupOptions::default())?;
    vault.wait_backup(&id)?;

    let path = archive_path(&root, &id);
    let len = fs::metadata(&path)?.len();
    let f = fs::OpenOptions::new().write(true).open(&path)?;
    f.set_len(len - 16)?;

    let report = vault.verify_snapshot(&id)?;
    assert!(!report.valid);
    assert!(!report.details.is_empty());
    Ok(())
}

#[test]
fn unknown_snapshot_is_a_validation_error() -> Result<()> {
    let root = unique_root("unknown");
    let vault = open_vault(&root, VaultConfig::default())?;

    let err = vault.verify_snapshot("deadbeef").unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());
    let err = vault.delete_snapshot("deadbeef").unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());
    Ok(())
}

#[test]
fn media_files_are_walked_and_verified() -> Result<()> {
    let root = unique_root("media");
    let media_dir = unique_root("media-src");
    fs::create_dir_all(media_dir.join("sub"))?;
    fs::write(media_dir.join("a.bin"), b"alpha media")?;
    fs::write(media_dir.join("sub/b.bin"), vec![7u8; 4096])?;

    let cfg = VaultConfig::default().with_media_dir(Some(&media_dir));
    let vault = open_vault(&root, cfg)?;
    let id = vault.create_snapshot(BackupOptions::default())?;
    let manifest = vault.wait_backup(&id)?;

    let rels: Vec<&str> = manifest
        .media_list
        .iter()
        .map(|m| m.relative_path.as_str())
        .collect();
    assert_eq!(rels, vec!["a.bin", "sub/b.bin"]);
    assert_eq!(manifest.media_list[0].byte_size, 11);
    assert_eq!(manifest.media_list[1].byte_size, 4096);

    let report = vault.verify_snapshot(&id)?;
    assert!(report.valid, "{:?}", report.details);

    // include_media=false skips the walk entirely.
    let id2 = vault.create_snapshot(BackupOptions {
        include_media: false,
        ..Default::default()
    })?;
    let manifest2 = vault.wait_backup(&id2)?;
    assert!(manifest2.media_list.is_empty());
    Ok(())
}

#[test]
fn delete_removes_snapshot_from_listing() -> Result<()> {
    let root = unique_root("delete");
    let vault = open_vault(&root, VaultConfig::default())?;

    let a = vault.create_snapshot(BackupOptions::default())?;
    vault.wait_backup(&a)?;
    let b = vault.create_snapshot(BackupOptions::default())?;
    vault.wait_backup(&b)?;

    let listed = vault.list_snapshots()?;
    assert_eq!(listed.len(), 2);
    // Oldest first.
    assert!(listed[0].created_unix_ms <= listed[1].created_unix_ms);

    vault.delete_snapshot(&a)?;
    let listed = vault.list_snapshots()?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].snapshot_id, b);
    Ok(())
}

#[test]
fn waited_jobs_are_pruned_when_the_next_is_accepted() -> Result<()> {
    let root = unique_root("prune");
    let vault = open_vault(&root, VaultConfig::default())?;

    let a = vault.create_snapshot(BackupOptions::default())?;
    vault.wait_backup(&a)?;
    assert!(vault.backup_status(&a).is_some());

    // Accepting the next job drops the already-joined entry; the new one
    // is tracked as usual.
    let b = vault.create_snapshot(BackupOptions::default())?;
    assert!(vault.backup_status(&a).is_none());
    assert!(vault.backup_status(&b).is_some());
    vault.wait_backup(&b)?;

    // The snapshots themselves are unaffected by registry pruning.
    assert_eq!(vault.list_snapshots()?.len(), 2);
    Ok(())
}

#[test]
fn busy_vault_rejects_second_backup() -> Result<()> {
    let root = unique_root("busy");
    let vault = open_vault(&root, VaultConfig::default())?;

    let _guard = try_acquire_exclusive_lock(&root)?;
    let err = vault.create_snapshot(BackupOptions::default()).unwrap_err();
    assert!(
        err.downcast_ref::<AlreadyInProgressError>().is_some(),
        "expected AlreadyInProgressError, got: {err:#}"
    );
    Ok(())
}
