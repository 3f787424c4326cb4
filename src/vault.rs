//! Vault: the embedding surface.
//!
//! A Vault owns one on-disk root plus the caller's schema and StateStore
//! and exposes the operation set: create_snapshot, verify_snapshot,
//! start_restore, status/wait/cancel, list and delete.
//!
//! Concurrency model:
//! - backup and restore are accepted jobs that run on a worker thread;
//!   the caller gets the id back immediately and polls or waits;
//! - the per-root exclusive LOCK is taken synchronously before the job is
//!   accepted, so "busy" surfaces as AlreadyInProgressError on the calling
//!   thread, never as a queued request;
//! - the lock guard moves into the worker and is released on Drop when the
//!   job reaches a terminal state.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::VaultConfig;
use crate::lock::try_acquire_exclusive_lock;
use crate::manifest::{generate_id, Manifest};
use crate::progress::{Phase, ProgressTracker, ProgressView};
use crate::restore::{
    read_record, write_record, RestoreOptions, RestoreOrchestrator, RestoreRecord, SharedRecord,
};
use crate::schema::{SchemaDescriptor, StateStore};
use crate::snapshot::{
    self, BackupOptions, SnapshotReader, SnapshotSummary, SnapshotWriter, VerifyReport,
};

/// The live target, shared with worker threads. Workers hold the mutex for
/// the duration of their run; the per-root LOCK already serializes
/// operations, so there is no lock-ordering subtlety here.
pub type SharedStore = Arc<Mutex<Box<dyn StateStore>>>;

struct BackupJob {
    tracker: Arc<ProgressTracker>,
    handle: Option<JoinHandle<Result<Manifest>>>,
}

struct RestoreJob {
    tracker: Arc<ProgressTracker>,
    record: SharedRecord,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Jobs {
    backups: HashMap<String, BackupJob>,
    restores: HashMap<String, RestoreJob>,
}

impl Jobs {
    /// Drop jobs that were already waited on, so a long-lived vault does
    /// not accumulate finished entries. A job the caller never joined is
    /// kept; restore status stays answerable from disk either way.
    fn prune_waited(&mut self) {
        self.backups.retain(|_, j| j.handle.is_some());
        self.restores.retain(|_, j| j.handle.is_some());
    }
}

pub struct Vault {
    root: PathBuf,
    cfg: VaultConfig,
    schema: SchemaDescriptor,
    store: SharedStore,
    jobs: Mutex<Jobs>,
}

impl Vault {
    /// Open (creating directories as needed) a vault rooted at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        cfg: VaultConfig,
        schema: SchemaDescriptor,
        store: Box<dyn StateStore>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create vault root {}", root.display()))?;
        fs::create_dir_all(snapshot::snapshots_dir(&root))
            .with_context(|| format!("create snapshots dir under {}", root.display()))?;
        fs::create_dir_all(snapshot::restores_dir(&root))
            .with_context(|| format!("create restores dir under {}", root.display()))?;
        info!(
            "vault: open, root={}, tables={}, cfg={}",
            root.display(),
            schema.tables.len(),
            cfg
        );
        Ok(Self {
            root,
            cfg,
            schema,
            store: Arc::new(Mutex::new(store)),
            jobs: Mutex::new(Jobs::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared handle to the live store. Callers must not hold it across
    /// their own wait_* calls: workers lock it for the whole run.
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    // ---------------- backup ----------------

    /// Accept a backup job. The exclusive lock is taken here, on the
    /// calling thread, so a busy vault fails fast; the returned id is both
    /// the job id and the id of the snapshot the job will commit.
    pub fn create_snapshot(&self, opts: BackupOptions) -> Result<String> {
        let guard = try_acquire_exclusive_lock(&self.root)?;
        let snapshot_id = generate_id();
        let tracker = Arc::new(ProgressTracker::new(self.deadline(opts.timeout)));

        let root = self.root.clone();
        let cfg = self.cfg.clone();
        let schema = self.schema.clone();
        let store = Arc::clone(&self.store);
        let worker_tracker = Arc::clone(&tracker);
        let id = snapshot_id.clone();

        let handle = std::thread::Builder::new()
            .name(format!("snapvault-backup-{}", &snapshot_id[..8]))
            .spawn(move || {
                let _guard = guard;
                let writer = SnapshotWriter::new(&root, &cfg, &schema);
                let store = store.lock().expect("store lock");
                let res = writer.run_with_id(&**store, &opts, &worker_tracker, &id);
                match &res {
                    Ok(_) => worker_tracker.set_phase(Phase::Completed),
                    Err(e) => {
                        worker_tracker.set_error(format!("{e:#}"));
                        worker_tracker.set_phase(Phase::Failed);
                    }
                }
                res
            })
            .context("spawn backup worker")?;

        {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            jobs.prune_waited();
            jobs.backups.insert(
                snapshot_id.clone(),
                BackupJob {
                    tracker,
                    handle: Some(handle),
                },
            );
        }
        info!("vault: backup accepted, id={snapshot_id}");
        Ok(snapshot_id)
    }

    /// Progress of an accepted backup; None for an unknown or pruned id.
    pub fn backup_status(&self, snapshot_id: &str) -> Option<ProgressView> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .backups
            .get(snapshot_id)
            .map(|j| j.tracker.snapshot())
    }

    /// Block until a backup job finishes and return its manifest. Each job
    /// can be waited on once; the tracker stays queryable until the next
    /// job is accepted.
    pub fn wait_backup(&self, snapshot_id: &str) -> Result<Manifest> {
        let handle = {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            let job = jobs
                .backups
                .get_mut(snapshot_id)
                .ok_or_else(|| anyhow!("unknown backup job {snapshot_id}"))?;
            job.handle
                .take()
                .ok_or_else(|| anyhow!("backup job {snapshot_id} already waited on"))?
        };
        handle
            .join()
            .map_err(|_| anyhow!("backup worker for {snapshot_id} panicked"))?
    }

    // ---------------- verify ----------------

    /// Standalone integrity verification of a committed snapshot. Unknown
    /// ids are an error; a known snapshot with a broken manifest or archive
    /// yields a report with valid=false rather than an error.
    pub fn verify_snapshot(&self, snapshot_id: &str) -> Result<VerifyReport> {
        if !snapshot::snapshot_dir(&self.root, snapshot_id).exists() {
            return Err(
                crate::errors::ValidationError(format!("unknown snapshot {snapshot_id}")).into(),
            );
        }
        match SnapshotReader::open(&self.root, snapshot_id) {
            Ok(reader) => reader.verify_report(),
            Err(e) => Ok(VerifyReport {
                snapshot_id: snapshot_id.to_string(),
                valid: false,
                details: vec![format!("manifest: {e:#}")],
            }),
        }
    }

    // ---------------- restore ----------------

    /// Accept a restore job. Exactly one RestoreRecord is created and
    /// persisted before the worker starts, so status is answerable from the
    /// first moment; the record then tracks the run to its terminal state.
    pub fn start_restore(&self, opts: RestoreOptions) -> Result<String> {
        let guard = try_acquire_exclusive_lock(&self.root)?;
        let record = RestoreRecord::new(&opts);
        let restore_id = record.restore_id.clone();
        write_record(&self.root, &record)?;
        let record: SharedRecord = Arc::new(Mutex::new(record));
        let tracker = Arc::new(ProgressTracker::new(self.deadline(opts.timeout)));

        let root = self.root.clone();
        let cfg = self.cfg.clone();
        let schema = self.schema.clone();
        let store = Arc::clone(&self.store);
        let worker_tracker = Arc::clone(&tracker);
        let worker_record = Arc::clone(&record);

        let handle = std::thread::Builder::new()
            .name(format!("snapvault-restore-{}", &restore_id[..8]))
            .spawn(move || {
                let _guard = guard;
                let orchestrator = RestoreOrchestrator::new(&root, &cfg, &schema);
                let mut store = store.lock().expect("store lock");
                // Terminal status lives in the record; the Result here only
                // mirrors it.
                let _ = orchestrator.run(store.as_mut(), &opts, &worker_tracker, &worker_record);
            })
            .context("spawn restore worker")?;

        {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            jobs.prune_waited();
            jobs.restores.insert(
                restore_id.clone(),
                RestoreJob {
                    tracker,
                    record,
                    handle: Some(handle),
                },
            );
        }
        info!("vault: restore accepted, id={restore_id}");
        Ok(restore_id)
    }

    /// Current record of a restore: from the in-memory job when the vault
    /// ran it, else from <root>/restores/<id>.json (earlier process runs).
    pub fn get_restore_status(&self, restore_id: &str) -> Result<RestoreRecord> {
        if let Some(job) = self.jobs.lock().expect("jobs lock").restores.get(restore_id) {
            return Ok(job.record.lock().expect("record lock").clone());
        }
        read_record(&self.root, restore_id)
    }

    /// Block until a restore job reaches a terminal state; returns the
    /// final record (status says how it ended — waiting never panics on a
    /// failed restore).
    pub fn wait_restore(&self, restore_id: &str) -> Result<RestoreRecord> {
        let handle = {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            let job = jobs
                .restores
                .get_mut(restore_id)
                .ok_or_else(|| anyhow!("unknown restore job {restore_id}"))?;
            job.handle
                .take()
                .ok_or_else(|| anyhow!("restore job {restore_id} already waited on"))?
        };
        handle
            .join()
            .map_err(|_| anyhow!("restore worker for {restore_id} panicked"))?;
        self.get_restore_status(restore_id)
    }

    // ---------------- common ----------------

    /// Request cooperative cancellation of an in-flight job (backup or
    /// restore). Returns false for an unknown id. The job notices at the
    /// next table/member boundary and takes its normal failure path,
    /// including rollback for a mutating restore.
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().expect("jobs lock");
        if let Some(j) = jobs.backups.get(job_id) {
            warn!("vault: cancelling backup {job_id}");
            j.tracker.cancel();
            return true;
        }
        if let Some(j) = jobs.restores.get(job_id) {
            warn!("vault: cancelling restore {job_id}");
            j.tracker.cancel();
            return true;
        }
        false
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        snapshot::list_snapshots(&self.root)
    }

    /// Delete a snapshot. Takes the exclusive lock for the duration so a
    /// snapshot is never deleted out from under a running operation.
    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let _guard = try_acquire_exclusive_lock(&self.root)?;
        snapshot::delete_snapshot(&self.root, snapshot_id)
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or(self.cfg.op_timeout)
            .map(|t| Instant::now() + t)
    }
}
