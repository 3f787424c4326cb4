//! RestoreOrchestrator: the multi-step destructive operation.
//!
//! State machine:
//!   Pending -> Validating -> PreBackupInProgress
//!     -> Restoring { Truncating, Loading, ReloadingMedia, ReapplyingConstraints }
//!     -> Verifying -> Completed | Failed | RolledBack
//!
//! Rules enforced here:
//! - checksum validation is a hard precondition; failure before the first
//!   truncate leaves live state untouched;
//! - unless skipped, a pre-restore snapshot of live state is taken first
//!   and becomes the rollback target;
//! - full restore truncates children-first (reverse dump order) and loads
//!   parents-first (forward dump order);
//! - selective restore rejects subsets with out-of-set dependents unless
//!   constraints are deferred for the operation;
//! - any failure after mutation started triggers an automatic rollback
//!   from the pre-restore snapshot; a failed rollback is the only truly
//!   unrecoverable terminal state and is surfaced loudly;
//! - dry run computes the truncate/load plan with zero writes.

mod record;

pub use record::{
    read_record, write_record, RestoreMode, RestoreOptions, RestoreRecord, RestoreStatus,
    TableDelta,
};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::VaultConfig;
use crate::errors::{RollbackFailedError, ValidationError};
use crate::manifest::Manifest;
use crate::progress::{Phase, ProgressTracker};
use crate::schema::{SchemaDescriptor, StateStore};
use crate::snapshot::{BackupOptions, SnapshotReader, SnapshotWriter};

pub type SharedRecord = Arc<Mutex<RestoreRecord>>;

pub struct RestoreOrchestrator<'a> {
    root: &'a Path,
    cfg: &'a VaultConfig,
    schema: &'a SchemaDescriptor,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(root: &'a Path, cfg: &'a VaultConfig, schema: &'a SchemaDescriptor) -> Self {
        Self { root, cfg, schema }
    }

    /// Drive one restore to a terminal state. The caller holds the
    /// target's exclusive lock for the whole call. This function decides
    /// terminal status itself; the returned Result only mirrors it for
    /// logging convenience.
    pub fn run(
        &self,
        store: &mut dyn StateStore,
        opts: &RestoreOptions,
        tracker: &ProgressTracker,
        record: &SharedRecord,
    ) -> Result<()> {
        let restore_id = { record.lock().expect("record lock").restore_id.clone() };
        info!(
            "restore: start, id={}, snapshot={}, dry_run={}, selective={}",
            restore_id,
            opts.snapshot_id,
            opts.dry_run,
            !opts.selected_tables.is_empty()
        );

        self.transition(record, tracker, Phase::Validating, RestoreStatus::InProgress);

        // ---------- Validating (no mutation yet) ----------
        let prepared = match self.validate(store, opts) {
            Ok(p) => p,
            Err(e) => {
                return self.fail(record, tracker, e, "validation");
            }
        };

        // ---------- Dry run: plan only, zero writes ----------
        if opts.dry_run {
            let mut deltas = Vec::with_capacity(prepared.tables.len());
            for t in &prepared.tables {
                let current = match store.row_count(t) {
                    Ok(n) => n,
                    Err(e) => return self.fail(record, tracker, e, "dry-run plan"),
                };
                let incoming = prepared
                    .manifest
                    .table(t)
                    .map(|e| e.record_count)
                    .unwrap_or(0);
                deltas.push(TableDelta {
                    table: t.clone(),
                    rows_to_delete: current,
                    rows_to_load: incoming,
                });
            }
            self.update(record, |r| {
                r.dry_run_report = Some(deltas);
                r.progress_percentage = 100;
            });
            self.transition(record, tracker, Phase::Completed, RestoreStatus::Completed);
            info!("restore: dry run complete, id={restore_id}");
            return Ok(());
        }

        // ---------- Pre-restore safety-net backup ----------
        let mut pre_id: Option<String> = None;
        if opts.create_pre_backup {
            self.transition(record, tracker, Phase::PreBackup, RestoreStatus::InProgress);
            if let Err(e) = tracker.checkpoint("pre-restore backup") {
                return self.fail(record, tracker, e, "pre-restore backup");
            }
            let writer = SnapshotWriter::new(self.root, self.cfg, self.schema);
            let backup_opts = BackupOptions {
                include_media: prepared.reload_media,
                compress: None,
                exclude_tables: Vec::new(),
                timeout: opts.timeout,
            };
            // Separate tracker: the restore's unit counts must not be
            // clobbered by the nested backup's.
            let sub = ProgressTracker::new(None);
            match writer.run(store, &backup_opts, &sub) {
                Ok(m) => {
                    info!("restore: pre-restore snapshot {}", m.snapshot_id);
                    self.update(record, |r| {
                        r.pre_restore_snapshot_id = Some(m.snapshot_id.clone())
                    });
                    pre_id = Some(m.snapshot_id);
                }
                Err(e) => {
                    return self.fail(
                        record,
                        tracker,
                        e.context("pre-restore backup failed"),
                        "pre-restore backup",
                    );
                }
            }
        } else {
            warn!("restore: pre-restore backup explicitly skipped, id={restore_id}");
        }

        // ---------- Restoring + Verifying (mutating; rollback on failure) ----------
        match self.restore_and_verify(store, opts, &prepared, tracker, record) {
            Ok(()) => {
                self.update(record, |r| r.progress_percentage = 100);
                self.transition(record, tracker, Phase::Completed, RestoreStatus::Completed);
                info!("restore: done, id={restore_id}");
                Ok(())
            }
            Err(restore_err) => {
                error!("restore: failed mid-flight, id={restore_id}: {restore_err:#}");
                tracker.set_error(format!("{restore_err:#}"));
                // Deferral is scoped to the operation; a failed run must not
                // leave enforcement disabled on the live store.
                if opts.defer_constraints {
                    if let Err(e) = store.set_constraints_deferred(false) {
                        warn!("restore: re-applying constraints after failure: {e:#}");
                    }
                }
                match &pre_id {
                    Some(pre) => match self.rollback(store, pre, &prepared) {
                        Ok(()) => {
                            let msg = format!("restore failed and was rolled back: {restore_err:#}");
                            self.update(record, |r| r.error_message = Some(msg.clone()));
                            self.transition(
                                record,
                                tracker,
                                Phase::RolledBack,
                                RestoreStatus::RolledBack,
                            );
                            warn!("restore: rolled back to {pre}, id={restore_id}");
                            Err(restore_err)
                        }
                        Err(rb_err) => {
                            let failure = RollbackFailedError {
                                restore_error: format!("{restore_err:#}"),
                                rollback_error: format!("{rb_err:#}"),
                            };
                            error!("restore: ROLLBACK FAILED, id={restore_id}: {failure}");
                            let e = anyhow::Error::new(failure);
                            self.update(record, |r| r.error_message = Some(format!("{e:#}")));
                            self.transition(record, tracker, Phase::Failed, RestoreStatus::Failed);
                            Err(e)
                        }
                    },
                    None => self.fail(record, tracker, restore_err, "restore"),
                }
            }
        }
    }

    // ---------------- phases ----------------

    fn validate(&self, store: &mut dyn StateStore, opts: &RestoreOptions) -> Result<Prepared> {
        let reader = SnapshotReader::open(self.root, &opts.snapshot_id)?;
        reader.validate()?;

        let dump_order = reader.table_order();
        let tables: Vec<String> = if opts.selected_tables.is_empty() {
            dump_order
        } else {
            for t in &opts.selected_tables {
                if !dump_order.iter().any(|d| d == t) {
                    return Err(
                        ValidationError(format!("selected table {t} is not in the snapshot")).into(),
                    );
                }
                if self.schema.table(t).is_none() {
                    return Err(
                        ValidationError(format!("selected table {t} is not in the schema")).into(),
                    );
                }
            }
            let conflicts = self.schema.out_of_set_dependents(&opts.selected_tables);
            if !conflicts.is_empty() && !opts.defer_constraints {
                let list: Vec<String> = conflicts
                    .iter()
                    .map(|(child, parent)| format!("{child} -> {parent}"))
                    .collect();
                return Err(ValidationError(format!(
                    "selective restore subset has out-of-set dependents with active constraints: {}",
                    list.join(", ")
                ))
                .into());
            }
            // Keep dump order for the subset.
            dump_order
                .into_iter()
                .filter(|t| opts.selected_tables.contains(t))
                .collect()
        };

        // Row counts must be answerable for every target table before any
        // mutation; this also catches schema/store drift early.
        for t in &tables {
            store
                .row_count(t)
                .with_context(|| format!("live row count for {t}"))?;
        }

        let reload_media = opts.restore_media
            && opts.selected_tables.is_empty()
            && !reader.manifest.media_list.is_empty()
            && self.cfg.media_dir.is_some();

        Ok(Prepared {
            manifest: reader.manifest.clone(),
            reader,
            tables,
            reload_media,
        })
    }

    fn restore_and_verify(
        &self,
        store: &mut dyn StateStore,
        opts: &RestoreOptions,
        prepared: &Prepared,
        tracker: &ProgressTracker,
        record: &SharedRecord,
    ) -> Result<()> {
        let media_units = if prepared.reload_media {
            prepared.manifest.media_list.len() as u64
        } else {
            0
        };
        tracker.begin_units(prepared.tables.len() as u64 * 2 + media_units);

        let deferred = opts.defer_constraints;
        if deferred {
            store
                .set_constraints_deferred(true)
                .context("defer constraints")?;
        }

        // Truncate children first.
        self.transition(record, tracker, Phase::Truncating, RestoreStatus::InProgress);
        for t in prepared.tables.iter().rev() {
            tracker.checkpoint(&format!("truncate {t}"))?;
            debug!("restore: truncate {t}");
            store.truncate(t).with_context(|| format!("truncate {t}"))?;
            tracker.unit_done();
        }

        // Load parents first.
        self.transition(record, tracker, Phase::Loading, RestoreStatus::InProgress);
        for t in &prepared.tables {
            tracker.checkpoint(&format!("load {t}"))?;
            let mut rows = prepared.reader.rows(t)?;
            let loaded = store
                .load(t, &mut rows)
                .with_context(|| format!("load {t}"))?;
            debug!("restore: loaded {loaded} rows into {t}");
            tracker.unit_done();
            self.bump_percent(record, tracker);
        }

        // Media files back onto disk.
        if prepared.reload_media {
            self.transition(
                record,
                tracker,
                Phase::ReloadingMedia,
                RestoreStatus::InProgress,
            );
            self.reload_media(prepared, tracker)?;
        }

        if deferred {
            self.transition(
                record,
                tracker,
                Phase::ReapplyingConstraints,
                RestoreStatus::InProgress,
            );
            store
                .set_constraints_deferred(false)
                .context("reapply constraints")?;
        }

        // Row counts against the manifest, plus the orphan spot check.
        self.transition(record, tracker, Phase::Verifying, RestoreStatus::InProgress);
        for t in &prepared.tables {
            let expected = prepared
                .manifest
                .table(t)
                .map(|e| e.record_count)
                .unwrap_or(0);
            let actual = store.row_count(t)?;
            if actual != expected {
                return Err(anyhow!(
                    "verification failed for table {t}: expected {expected} rows, found {actual}"
                ));
            }
        }
        if self.cfg.spot_check_orphans {
            for t in &prepared.tables {
                let spec = match self.schema.table(t) {
                    Some(s) => s,
                    None => continue,
                };
                for fk in &spec.foreign_keys {
                    if let Some(orphans) = store.orphan_count(t, fk)? {
                        if orphans > 0 {
                            return Err(anyhow!(
                                "verification failed: {orphans} orphaned rows in {t}.{} -> {}",
                                fk.column,
                                fk.references_table
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reload_media(&self, prepared: &Prepared, tracker: &ProgressTracker) -> Result<()> {
        let media_root = self
            .cfg
            .media_dir
            .as_ref()
            .ok_or_else(|| anyhow!("media reload requested without media_dir"))?;
        for asset in &prepared.manifest.media_list {
            tracker.checkpoint(&format!("media file {}", asset.relative_path))?;
            let dst = media_root.join(&asset.relative_path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create media dir {}", parent.display()))?;
            }
            let mut src = prepared.reader.media_reader(&asset.relative_path)?;
            let mut out = fs::File::create(&dst)
                .with_context(|| format!("create media file {}", dst.display()))?;
            std::io::copy(&mut src, &mut out)
                .with_context(|| format!("write media file {}", dst.display()))?;
            set_file_mode(&out, asset.mode);
            tracker.unit_done();
        }
        Ok(())
    }

    /// Put live state back to the pre-restore snapshot. Runs on the same
    /// table set the failed restore touched; media is restored too when it
    /// was part of the operation. No verification pass and no nested
    /// safety net here: this IS the safety net.
    fn rollback(&self, store: &mut dyn StateStore, pre_id: &str, prepared: &Prepared) -> Result<()> {
        warn!("restore: attempting rollback from {pre_id}");
        let reader = SnapshotReader::open(self.root, pre_id)?;
        reader.validate()?;

        let order = reader.table_order();
        let tables: Vec<String> = order
            .into_iter()
            .filter(|t| prepared.tables.contains(t))
            .collect();

        for t in tables.iter().rev() {
            store
                .truncate(t)
                .with_context(|| format!("rollback truncate {t}"))?;
        }
        for t in &tables {
            let mut rows = reader.rows(t)?;
            store
                .load(t, &mut rows)
                .with_context(|| format!("rollback load {t}"))?;
        }

        if prepared.reload_media {
            if let Some(media_root) = &self.cfg.media_dir {
                for asset in reader.media_assets() {
                    let dst = media_root.join(&asset.relative_path);
                    if let Some(parent) = dst.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut src = reader.media_reader(&asset.relative_path)?;
                    let mut out = fs::File::create(&dst)?;
                    std::io::copy(&mut src, &mut out)?;
                    set_file_mode(&out, asset.mode);
                }
            }
        }
        Ok(())
    }

    // ---------------- record/tracker plumbing ----------------

    fn transition(
        &self,
        record: &SharedRecord,
        tracker: &ProgressTracker,
        phase: Phase,
        status: RestoreStatus,
    ) {
        tracker.set_phase(phase);
        self.update(record, |r| {
            r.current_phase = phase.as_str().to_string();
            r.status = status;
        });
    }

    fn bump_percent(&self, record: &SharedRecord, tracker: &ProgressTracker) {
        let pct = tracker.snapshot().percent;
        self.update(record, |r| r.progress_percentage = pct);
    }

    fn update<F: FnOnce(&mut RestoreRecord)>(&self, record: &SharedRecord, f: F) {
        let snapshot = {
            let mut r = record.lock().expect("record lock");
            f(&mut r);
            r.touch();
            r.clone()
        };
        if let Err(e) = write_record(self.root, &snapshot) {
            warn!("restore: persisting record {} failed: {e}", snapshot.restore_id);
        }
    }

    fn fail(
        &self,
        record: &SharedRecord,
        tracker: &ProgressTracker,
        err: anyhow::Error,
        stage: &str,
    ) -> Result<()> {
        let msg = format!("{stage}: {err:#}");
        error!("restore: {msg}");
        tracker.set_error(msg.clone());
        self.update(record, |r| r.error_message = Some(msg));
        self.transition(record, tracker, Phase::Failed, RestoreStatus::Failed);
        Err(err)
    }
}

/// Everything Validating resolved; immutable for the rest of the run.
struct Prepared {
    manifest: Manifest,
    reader: SnapshotReader,
    tables: Vec<String>,
    reload_media: bool,
}

#[cfg(unix)]
fn set_file_mode(f: &fs::File, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        let _ = f.set_permissions(fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn set_file_mode(_f: &fs::File, _mode: u32) {}
