//! Shared, pollable progress state for in-flight operations.
//!
//! One tracker per accepted job. Percent is completed_units/total_units
//! (one unit = one table or one media file) and is recomputed from real
//! completion only — never interpolated from wall-clock time.
//!
//! Cancellation is cooperative: workers check is_cancelled() at table and
//! member boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Phases an operation can report. Backup and restore share the type so
/// collaborators can render either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    // backup
    ResolvingOrder,
    DumpingTables,
    CopyingMedia,
    Finalizing,
    // restore
    Validating,
    PreBackup,
    Truncating,
    Loading,
    ReloadingMedia,
    ReapplyingConstraints,
    Verifying,
    // terminal
    Completed,
    Failed,
    RolledBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::ResolvingOrder => "resolving_order",
            Phase::DumpingTables => "dumping_tables",
            Phase::CopyingMedia => "copying_media",
            Phase::Finalizing => "finalizing",
            Phase::Validating => "validating",
            Phase::PreBackup => "pre_backup",
            Phase::Truncating => "truncating",
            Phase::Loading => "loading",
            Phase::ReloadingMedia => "reloading_media",
            Phase::ReapplyingConstraints => "reapplying_constraints",
            Phase::Verifying => "verifying",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone)]
struct State {
    phase: Phase,
    completed_units: u64,
    total_units: u64,
    last_error: Option<String>,
}

/// Point-in-time view returned by snapshot().
#[derive(Debug, Clone)]
pub struct ProgressView {
    pub phase: Phase,
    pub completed_units: u64,
    pub total_units: u64,
    pub percent: u8,
    pub last_error: Option<String>,
}

pub struct ProgressTracker {
    state: Mutex<State>,
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Pending,
                completed_units: 0,
                total_units: 0,
                last_error: None,
            }),
            cancelled: AtomicBool::new(false),
            deadline,
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        let mut s = self.state.lock().expect("progress lock");
        s.phase = phase;
    }

    /// Start a new unit-counted stretch of work.
    pub fn begin_units(&self, total: u64) {
        let mut s = self.state.lock().expect("progress lock");
        s.completed_units = 0;
        s.total_units = total;
    }

    pub fn unit_done(&self) {
        let mut s = self.state.lock().expect("progress lock");
        s.completed_units = (s.completed_units + 1).min(s.total_units.max(1));
    }

    pub fn set_error(&self, msg: impl Into<String>) {
        let mut s = self.state.lock().expect("progress lock");
        s.last_error = Some(msg.into());
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Boundary check used by workers between tables/members: cancellation
    /// and deadline expiry both surface as plain errors and take the same
    /// failure/rollback path as any other error.
    pub fn checkpoint(&self, what: &str) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(anyhow::anyhow!("operation cancelled before {what}"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(anyhow::anyhow!("operation timed out before {what}"));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ProgressView {
        let s = self.state.lock().expect("progress lock");
        let percent = if s.total_units == 0 {
            match s.phase {
                Phase::Completed | Phase::RolledBack => 100,
                _ => 0,
            }
        } else {
            ((s.completed_units * 100) / s.total_units) as u8
        };
        ProgressView {
            phase: s.phase,
            completed_units: s.completed_units,
            total_units: s.total_units,
            percent,
            last_error: s.last_error.clone(),
        }
    }
}
