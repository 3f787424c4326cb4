//! RestoreRecord: the per-operation status document.
//!
//! Created once when a restore is accepted, mutated only by the
//! orchestrator until it reaches a terminal state, persisted as JSON under
//! <root>/restores/<id>.json (tmp+rename on every phase transition) so
//! status survives the process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::manifest::{generate_id, now_unix_ms};
use crate::snapshot::restores_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    Full,
    Selective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl RestoreStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RestoreStatus::Completed | RestoreStatus::Failed | RestoreStatus::RolledBack
        )
    }
}

/// One row of a dry-run plan: what a real restore would delete and load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDelta {
    pub table: String,
    pub rows_to_delete: u64,
    pub rows_to_load: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub restore_id: String,
    pub snapshot_id: String,
    pub mode: RestoreMode,
    #[serde(default)]
    pub selected_tables: Vec<String>,
    pub dry_run: bool,
    pub pre_restore_snapshot_id: Option<String>,
    pub status: RestoreStatus,
    pub progress_percentage: u8,
    pub current_phase: String,
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_report: Option<Vec<TableDelta>>,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

impl RestoreRecord {
    pub fn new(opts: &RestoreOptions) -> Self {
        let now = now_unix_ms();
        Self {
            restore_id: generate_id(),
            snapshot_id: opts.snapshot_id.clone(),
            mode: if opts.selected_tables.is_empty() {
                RestoreMode::Full
            } else {
                RestoreMode::Selective
            },
            selected_tables: opts.selected_tables.clone(),
            dry_run: opts.dry_run,
            pre_restore_snapshot_id: None,
            status: RestoreStatus::Pending,
            progress_percentage: 0,
            current_phase: "pending".to_string(),
            error_message: None,
            dry_run_report: None,
            created_unix_ms: now,
            updated_unix_ms: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_unix_ms = now_unix_ms();
    }
}

/// Parameters of one restore request.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub snapshot_id: String,
    pub dry_run: bool,
    pub create_pre_backup: bool,
    /// Empty means full restore.
    pub selected_tables: Vec<String>,
    /// Defer FK enforcement for the operation (required for selective
    /// subsets with out-of-set dependents, and for self-referencing tables).
    pub defer_constraints: bool,
    /// Reload media members (full restore only).
    pub restore_media: bool,
    /// Overrides VaultConfig::op_timeout when set.
    pub timeout: Option<Duration>,
}

impl RestoreOptions {
    pub fn new(snapshot_id: impl Into<String>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            dry_run: false,
            create_pre_backup: true,
            selected_tables: Vec::new(),
            defer_constraints: false,
            restore_media: true,
            timeout: None,
        }
    }
}

fn record_path(root: &Path, restore_id: &str) -> std::path::PathBuf {
    restores_dir(root).join(format!("{restore_id}.json"))
}

/// Persist a record (pretty JSON, tmp+rename).
pub fn write_record(root: &Path, r: &RestoreRecord) -> Result<()> {
    let dir = restores_dir(root);
    if !dir.exists() {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let path = record_path(root, &r.restore_id);
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(r).context("serialize restore record")?;
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open tmp record {}", tmp.display()))?;
        f.write_all(json.as_bytes())?;
        f.flush()?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Load a record by id.
pub fn read_record(root: &Path, restore_id: &str) -> Result<RestoreRecord> {
    let path = record_path(root, restore_id);
    let mut f = OpenOptions::new()
        .read(true)
        .open(&path)
        .with_context(|| format!("open restore record {}", path.display()))?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    serde_json::from_str(&buf).context("parse restore record json")
}
