//! Typed error taxonomy for the engine.
//!
//! Errors travel as anyhow::Error with context strings (same propagation
//! style as the rest of the codebase); these types exist so the two
//! orchestrators can classify failures with downcast_ref and so callers
//! see a stable taxonomy instead of free-form strings.
//!
//! Rules:
//! - Lower-layer components raise and propagate; they never catch-and-continue.
//! - Only SnapshotWriter and RestoreOrchestrator decide terminal status.

use thiserror::Error;

/// Bad input: unknown table, incompatible schema version, selective-restore
/// subset with out-of-set dependents. Not retryable.
#[derive(Debug, Error)]
#[error("validation failed: {0}")]
pub struct ValidationError(pub String);

/// A row failed to encode or decode. Aborts the whole run; a bad row is
/// never skipped silently.
#[derive(Debug, Error)]
#[error("serialization failed: table={table}, row={row_index}, field={field}: {detail}")]
pub struct SerializationError {
    pub table: String,
    pub row_index: u64,
    pub field: usize,
    pub detail: String,
}

/// Stored content does not match its recorded hash. Corruption; the engine
/// refuses to proceed.
#[derive(Debug, Error)]
#[error("checksum mismatch for {member}: expected {expected}, got {actual}")]
pub struct ChecksumMismatchError {
    pub member: String,
    pub expected: String,
    pub actual: String,
}

/// The archive container itself is structurally broken (bad magic, torn
/// chunk, missing trailer). Distinct from a checksum failure.
#[derive(Debug, Error)]
#[error("archive corrupt: {0}")]
pub struct ArchiveCorruptError(pub String);

/// The FK graph cannot be linearized.
#[derive(Debug, Error)]
#[error("cyclic foreign-key dependency between tables: {}", tables.join(", "))]
pub struct CyclicDependencyError {
    pub tables: Vec<String>,
}

/// Another backup/restore already holds the target's exclusive lock.
/// Retryable by the caller; requests are never queued silently.
#[derive(Debug, Error)]
#[error("operation already in progress for {0}")]
pub struct AlreadyInProgressError(pub String);

/// A restore failed AND the safety-net rollback failed. Live state is of
/// unknown consistency; never auto-retried.
#[derive(Debug, Error)]
#[error("restore failed ({restore_error}) and rollback also failed ({rollback_error}); manual intervention required")]
pub struct RollbackFailedError {
    pub restore_error: String,
    pub rollback_error: String,
}
