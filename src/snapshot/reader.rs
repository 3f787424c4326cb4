//! SnapshotReader: open, validate and lazily read one artifact.
//!
//! Validation is a hard precondition for restore: per-member SHA-256
//! against the manifest plus the aggregate over all member digests. The
//! same walk backs the standalone "verify backup integrity" operation,
//! which collects problems into a report instead of failing on the first.

use anyhow::{Context, Result};
use log::{debug, info};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::archive::ArchiveReader;
use crate::checksum;
use crate::errors::{ArchiveCorruptError, ChecksumMismatchError, ValidationError};
use crate::manifest::{read_manifest, Manifest, MediaAsset};
use crate::serializer::RowDecoder;

use super::{archive_path, manifest_path, snapshot_dir};

/// Outcome of verify_snapshot: valid iff details is empty.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub snapshot_id: String,
    pub valid: bool,
    pub details: Vec<String>,
}

pub struct SnapshotReader {
    pub manifest: Manifest,
    archive: PathBuf,
}

impl SnapshotReader {
    /// Open a committed snapshot. Unknown id or unsupported schema_version
    /// is a ValidationError; no archive byte is touched yet.
    pub fn open(root: &Path, snapshot_id: &str) -> Result<Self> {
        let dir = snapshot_dir(root, snapshot_id);
        if !dir.exists() {
            return Err(ValidationError(format!("unknown snapshot {snapshot_id}")).into());
        }
        let manifest = read_manifest(&manifest_path(root, snapshot_id))?;
        Ok(Self {
            manifest,
            archive: archive_path(root, snapshot_id),
        })
    }

    /// Dump-order table list (manifest order, parents first).
    pub fn table_order(&self) -> Vec<String> {
        self.manifest
            .table_list
            .iter()
            .map(|t| t.table_name.clone())
            .collect()
    }

    pub fn media_assets(&self) -> &[MediaAsset] {
        &self.manifest.media_list
    }

    /// Full integrity validation; the first divergence aborts with a typed
    /// error. Destructive restore steps must not run before this passes.
    pub fn validate(&self) -> Result<()> {
        let mut reader = ArchiveReader::open(&self.archive)?;
        let mut actual_hashes = Vec::new();
        for (member, expected_hash) in self.expected_members() {
            let entry = reader
                .next_member()?
                .ok_or_else(|| ArchiveCorruptError(format!("{member}: missing from archive")))?;
            if entry.name != member {
                return Err(ArchiveCorruptError(format!(
                    "{member}: archive order mismatch (found {})",
                    entry.name
                ))
                .into());
            }
            let digest = entry.drain()?;
            debug!(
                "validate: member {} stored_bytes={} crc_ok={}",
                member, digest.stored_bytes, digest.crc_ok
            );
            if digest.hash_hex != expected_hash {
                return Err(ChecksumMismatchError {
                    member,
                    expected: expected_hash,
                    actual: digest.hash_hex,
                }
                .into());
            }
            actual_hashes.push(digest.hash_hex);
        }
        if reader.next_member()?.is_some() {
            return Err(
                ArchiveCorruptError("archive has members beyond the manifest".to_string()).into(),
            );
        }
        let aggregate = checksum::aggregate(&actual_hashes);
        if aggregate != self.manifest.checksum {
            return Err(ChecksumMismatchError {
                member: "aggregate".to_string(),
                expected: self.manifest.checksum.clone(),
                actual: aggregate,
            }
            .into());
        }
        Ok(())
    }

    /// Walk every member and collect problems instead of failing on the
    /// first one; this backs the standalone verify operation. Structural
    /// breakage mid-walk is reported against the member where it happened
    /// (nothing past a torn frame can be trusted, so the walk stops there).
    pub fn verify_report(&self) -> Result<VerifyReport> {
        let mut details = Vec::new();

        match ArchiveReader::open(&self.archive) {
            Ok(mut reader) => {
                let expected = self.expected_members();
                let mut actual_hashes = Vec::with_capacity(expected.len());
                let mut structural_stop = false;

                for (member, expected_hash) in &expected {
                    let entry = match reader.next_member() {
                        Ok(Some(e)) => e,
                        Ok(None) => {
                            details.push(format!("{member}: missing from archive"));
                            structural_stop = true;
                            break;
                        }
                        Err(e) => {
                            details.push(format!("{member}: {e}"));
                            structural_stop = true;
                            break;
                        }
                    };
                    if &entry.name != member {
                        details.push(format!(
                            "{member}: archive order mismatch (found {})",
                            entry.name
                        ));
                        structural_stop = true;
                        break;
                    }
                    match entry.drain() {
                        Ok(digest) => {
                            if &digest.hash_hex != expected_hash {
                                details.push(format!(
                                    "{member}: checksum mismatch (expected {expected_hash}, got {})",
                                    digest.hash_hex
                                ));
                            } else if !digest.crc_ok {
                                details.push(format!("{member}: frame crc mismatch"));
                            }
                            actual_hashes.push(digest.hash_hex);
                        }
                        Err(e) => {
                            details.push(format!("{member}: {e}"));
                            structural_stop = true;
                            break;
                        }
                    }
                }

                if !structural_stop && details.is_empty() {
                    match reader.next_member() {
                        Ok(Some(extra)) => {
                            details.push(format!("unexpected archive member {}", extra.name))
                        }
                        Ok(None) => {}
                        Err(e) => details.push(format!("archive trailer: {e}")),
                    }
                    let aggregate = checksum::aggregate(&actual_hashes);
                    if aggregate != self.manifest.checksum {
                        details.push(format!(
                            "aggregate: checksum mismatch (expected {}, got {aggregate})",
                            self.manifest.checksum
                        ));
                    }
                }
            }
            Err(e) => details.push(format!("archive: {e}")),
        }

        let valid = details.is_empty();
        info!(
            "verify: id={}, valid={}, problems={}",
            self.manifest.snapshot_id,
            valid,
            details.len()
        );
        Ok(VerifyReport {
            snapshot_id: self.manifest.snapshot_id.clone(),
            valid,
            details,
        })
    }

    /// (member name, expected checksum) pairs in manifest order.
    fn expected_members(&self) -> Vec<(String, String)> {
        self.manifest
            .table_list
            .iter()
            .map(|t| (t.member.clone(), t.checksum.clone()))
            .chain(
                self.manifest
                    .media_list
                    .iter()
                    .map(|m| (m.member(), m.checksum.clone())),
            )
            .collect()
    }

    /// Lazy row iterator for one table. Opens its own archive cursor, so
    /// multiple tables can be read without rewinding shared state.
    pub fn rows(&self, table: &str) -> Result<RowDecoder<Box<dyn Read + Send>>> {
        let entry = self
            .manifest
            .table(table)
            .ok_or_else(|| ValidationError(format!("snapshot has no table {table}")))?;
        let reader = ArchiveReader::open(&self.archive)?;
        let data = reader
            .into_member_reader(&entry.member)
            .with_context(|| format!("open member for table {table}"))?;
        Ok(RowDecoder::new(table, data))
    }

    /// Decoded byte stream for one media asset.
    pub fn media_reader(&self, relative_path: &str) -> Result<Box<dyn Read + Send>> {
        let asset = self
            .manifest
            .media_list
            .iter()
            .find(|m| m.relative_path == relative_path)
            .ok_or_else(|| ValidationError(format!("snapshot has no media file {relative_path}")))?;
        let reader = ArchiveReader::open(&self.archive)?;
        reader.into_member_reader(&asset.member())
    }
}
