// tests/roundtrip.rs
//
// Run only this file:
//   cargo test --test roundtrip -- --nocapture
//
// Covers:
// 1) Every value kind survives backup + read-back bit-exactly.
// 2) NULL, empty string, zero and empty bytes stay distinct.
// 3) An empty table round-trips with record_count 0.
// 4) Gzip compression changes the stored bytes, not the decoded rows.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use snapvault::config::VaultConfig;
use snapvault::manifest::Compression;
use snapvault::memory::MemoryStore;
use snapvault::progress::ProgressTracker;
use snapvault::schema::{SchemaDescriptor, TableSpec};
use snapvault::snapshot::{BackupOptions, SnapshotReader, SnapshotWriter};
use snapvault::value::{Row, Value};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("svtest-roundtrip-{prefix}-{pid}-{t}-{id}"))
}

fn one_table_schema(name: &str) -> SchemaDescriptor {
    SchemaDescriptor::new(vec![TableSpec {
        name: name.to_string(),
        foreign_keys: Vec::new(),
    }])
}

fn specimen_rows() -> Vec<Row> {
    vec![
        vec![
            Value::Int(1),
            Value::Bool(true),
            Value::Float(-0.125),
            Value::Decimal {
                mantissa: -1999,
                scale: 2,
            },
            Value::Text("héllo wörld".to_string()),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::timestamp_with_offset(7_200_000_000, 7_200),
        ],
        vec![
            Value::Int(i64::MIN),
            Value::Bool(false),
            Value::Float(f64::MAX),
            Value::Decimal {
                mantissa: i128::MAX,
                scale: 30,
            },
            Value::Text(String::new()),
            Value::Bytes(Vec::new()),
            Value::Timestamp {
                unix_micros: -1,
                offset_secs: -18_000,
            },
        ],
        vec![Value::Null, Value::Null],
    ]
}

fn backup_rows(
    root: &std::path::Path,
    cfg: &VaultConfig,
    table: &str,
    rows: Vec<Row>,
    compress: Option<Compression>,
) -> Result<String> {
    let schema = one_table_schema(table);
    let mut store = MemoryStore::new(schema.clone());
    for r in rows {
        store.insert(table, r)?;
    }
    let writer = SnapshotWriter::new(root, cfg, &schema);
    let opts = BackupOptions {
        compress,
        ..Default::default()
    };
    let manifest = writer.run(&store, &opts, &ProgressTracker::new(None))?;
    Ok(manifest.snapshot_id)
}

#[test]
fn every_value_kind_round_trips_exactly() -> Result<()> {
    let root = unique_root("kinds");
    fs::create_dir_all(&root)?;
    let cfg = VaultConfig::default();
    let rows = specimen_rows();
    let id = backup_rows(&root, &cfg, "specimen", rows.clone(), None)?;

    let reader = SnapshotReader::open(&root, &id)?;
    reader.validate()?;
    let got: Vec<Row> = reader.rows("specimen")?.collect::<Result<_>>()?;
    assert_eq!(got, rows);
    Ok(())
}

#[test]
fn nan_float_survives_bit_exact() -> Result<()> {
    let root = unique_root("nan");
    fs::create_dir_all(&root)?;
    let cfg = VaultConfig::default();
    let nan_bits = f64::NAN.to_bits();
    let rows = vec![vec![Value::Float(f64::from_bits(nan_bits))]];
    let id = backup_rows(&root, &cfg, "t", rows, None)?;

    let reader = SnapshotReader::open(&root, &id)?;
    let got: Vec<Row> = reader.rows("t")?.collect::<Result<_>>()?;
    assert_eq!(got.len(), 1);
    match got[0][0] {
        Value::Float(f) => assert_eq!(f.to_bits(), nan_bits),
        ref other => panic!("expected float, got {other:?}"),
    }
    Ok(())
}

#[test]
fn null_empty_and_zero_stay_distinct() -> Result<()> {
    let root = unique_root("distinct");
    fs::create_dir_all(&root)?;
    let cfg = VaultConfig::default();
    let rows = vec![vec![
        Value::Null,
        Value::Text(String::new()),
        Value::Int(0),
        Value::Bytes(Vec::new()),
    ]];
    let id = backup_rows(&root, &cfg, "t", rows.clone(), None)?;

    let reader = SnapshotReader::open(&root, &id)?;
    let got: Vec<Row> = reader.rows("t")?.collect::<Result<_>>()?;
    assert_eq!(got, rows);
    assert_eq!(got[0][0], Value::Null);
    assert_ne!(got[0][0], Value::Text(String::new()));
    assert_ne!(got[0][2], Value::Null);
    Ok(())
}

#[test]
fn empty_table_round_trips() -> Result<()> {
    let root = unique_root("empty");
    fs::create_dir_all(&root)?;
    let cfg = VaultConfig::default();
    let id = backup_rows(&root, &cfg, "nothing", Vec::new(), None)?;

    let reader = SnapshotReader::open(&root, &id)?;
    reader.validate()?;
    let entry = reader.manifest.table("nothing").expect("table entry");
    assert_eq!(entry.record_count, 0);
    let got: Vec<Row> = reader.rows("nothing")?.collect::<Result<_>>()?;
    assert!(got.is_empty());
    Ok(())
}

#[test]
fn gzip_backup_decodes_to_same_rows() -> Result<()> {
    let root = unique_root("gzip");
    fs::create_dir_all(&root)?;
    let cfg = VaultConfig::default();
    // Repetitive rows so gzip actually compresses.
    let rows: Vec<Row> = (0..500)
        .map(|i| {
            vec![
                Value::Int(i),
                Value::Text("the same text again and again".to_string()),
            ]
        })
        .collect();
    let id = backup_rows(&root, &cfg, "bulk", rows.clone(), Some(Compression::Gzip))?;

    let reader = SnapshotReader::open(&root, &id)?;
    reader.validate()?;
    assert_eq!(reader.manifest.compression, Compression::Gzip);
    let got: Vec<Row> = reader.rows("bulk")?.collect::<Result<_>>()?;
    assert_eq!(got, rows);
    Ok(())
}
