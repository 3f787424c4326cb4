//! Snapshot manifest: the structured metadata describing one artifact.
//!
//! Stored as pretty JSON next to the archive
//! (<root>/snapshots/<id>/manifest.json), written once via tmp+rename at
//! the successful end of a SnapshotWriter run, immutable thereafter.
//!
//! Invariant: table_list is a valid topological order of the FK graph
//! (parents before children); the restore path relies on it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Manifest format version understood by this build. Readers refuse
/// anything else rather than guess.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
}

/// One table member of the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub table_name: String,
    pub record_count: u64,
    /// Archive member name, e.g. "tables/customer.dat".
    pub member: String,
    /// Hex SHA-256 of the stored member bytes.
    pub checksum: String,
}

/// One media file member of the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    pub relative_path: String,
    pub byte_size: u64,
    pub checksum: String,
    /// Unix permission bits (0 where unavailable).
    pub mode: u32,
}

impl MediaAsset {
    pub fn member(&self) -> String {
        format!("media/{}", self.relative_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: String,
    pub created_unix_ms: u64,
    pub schema_version: u32,
    pub table_list: Vec<TableEntry>,
    #[serde(default)]
    pub media_list: Vec<MediaAsset>,
    pub total_record_count: u64,
    pub total_byte_size: u64,
    pub compression: Compression,
    /// Hex SHA-256 over the concatenation of member checksums in manifest
    /// order (tables first, then media).
    pub checksum: String,
}

impl Manifest {
    /// Member checksums in manifest order; the aggregate hashes exactly this.
    pub fn member_checksums(&self) -> Vec<String> {
        self.table_list
            .iter()
            .map(|t| t.checksum.clone())
            .chain(self.media_list.iter().map(|m| m.checksum.clone()))
            .collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableEntry> {
        self.table_list.iter().find(|t| t.table_name == name)
    }
}

/// Write a manifest (pretty JSON, tmp+rename).
pub fn write_manifest(path: &Path, m: &Manifest) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(m).context("serialize manifest")?;
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open tmp manifest {}", tmp.display()))?;
        f.write_all(json.as_bytes())?;
        f.flush()?;
        let _ = f.sync_all();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Read a manifest; rejects unsupported versions.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let mut f = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("open manifest {}", path.display()))?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let m: Manifest = serde_json::from_str(&buf).context("parse manifest json")?;
    if m.schema_version != SCHEMA_VERSION {
        return Err(crate::errors::ValidationError(format!(
            "unsupported manifest schema_version {} (expected {})",
            m.schema_version, SCHEMA_VERSION
        ))
        .into());
    }
    Ok(m)
}

/// Generate a random snapshot/restore id (hex, 32 characters).
pub fn generate_id() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    crate::checksum::hex_encode(&buf)
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
