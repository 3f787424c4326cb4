//! Snapshot store: on-disk layout, listing, deletion.
//!
//! Layout under the vault root:
//! - <root>/snapshots/<id>/manifest.json
//! - <root>/snapshots/<id>/archive.dat
//! - <root>/restores/<restore_id>.json
//!
//! A snapshot is built in <root>/snapshots/.tmp-<id> and renamed into
//! place at the end of a successful writer run; the rename is the single
//! commit point. Deletion renames the directory to .del-<id> first, so a
//! snapshot is either fully present or not selectable at all.

pub mod reader;
pub mod writer;

pub use reader::{SnapshotReader, VerifyReport};
pub use writer::{BackupOptions, SnapshotWriter};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::manifest::{read_manifest, Compression};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ARCHIVE_FILE: &str = "archive.dat";

pub fn snapshots_dir(root: &Path) -> PathBuf {
    root.join("snapshots")
}

pub fn snapshot_dir(root: &Path, id: &str) -> PathBuf {
    snapshots_dir(root).join(id)
}

pub fn manifest_path(root: &Path, id: &str) -> PathBuf {
    snapshot_dir(root, id).join(MANIFEST_FILE)
}

pub fn archive_path(root: &Path, id: &str) -> PathBuf {
    snapshot_dir(root, id).join(ARCHIVE_FILE)
}

pub fn restores_dir(root: &Path) -> PathBuf {
    root.join("restores")
}

/// Manifest summary for listings; everything a dashboard needs without
/// touching the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: String,
    pub created_unix_ms: u64,
    pub table_count: usize,
    pub media_count: usize,
    pub total_record_count: u64,
    pub total_byte_size: u64,
    pub compression: Compression,
}

/// List committed snapshots, oldest first. Hidden (.tmp-/.del-) directories
/// are in-flight or dying and never listed.
pub fn list_snapshots(root: &Path) -> Result<Vec<SnapshotSummary>> {
    let dir = snapshots_dir(root);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for e in fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let e = e?;
        let name = e.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with('.') || !e.path().is_dir() {
            continue;
        }
        let m = match read_manifest(&manifest_path(root, name)) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("list_snapshots: skipping {name}: {e}");
                continue;
            }
        };
        out.push(SnapshotSummary {
            snapshot_id: m.snapshot_id,
            created_unix_ms: m.created_unix_ms,
            table_count: m.table_list.len(),
            media_count: m.media_list.len(),
            total_record_count: m.total_record_count,
            total_byte_size: m.total_byte_size,
            compression: m.compression,
        });
    }
    out.sort_by(|a, b| {
        (a.created_unix_ms, &a.snapshot_id).cmp(&(b.created_unix_ms, &b.snapshot_id))
    });
    Ok(out)
}

/// Delete manifest + archive atomically or not at all: the directory is
/// renamed out of the visible namespace first, then removed.
pub fn delete_snapshot(root: &Path, id: &str) -> Result<()> {
    let dir = snapshot_dir(root, id);
    if !dir.exists() {
        return Err(crate::errors::ValidationError(format!("unknown snapshot {id}")).into());
    }
    let doomed = snapshots_dir(root).join(format!(".del-{id}"));
    fs::rename(&dir, &doomed)
        .with_context(|| format!("rename {} -> {}", dir.display(), doomed.display()))?;
    fs::remove_dir_all(&doomed).with_context(|| format!("remove {}", doomed.display()))?;
    log::info!("snapshot deleted: id={id}");
    Ok(())
}
