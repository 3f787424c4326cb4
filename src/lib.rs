// Base modules
pub mod checksum;
pub mod config;
pub mod errors;
pub mod lock;
pub mod manifest;
pub mod progress;

// Data model and the live-state seam
pub mod schema;
pub mod value;

// Engine pipeline
pub mod archive; // src/archive/{mod,writer,reader}.rs
pub mod deps;
pub mod serializer;
pub mod snapshot; // src/snapshot/{mod,writer,reader}.rs

// Orchestration
pub mod restore; // src/restore/{mod,record}.rs
pub mod vault;

// Reference/testing StateStore
pub mod memory;

// Convenience re-exports
pub use config::VaultConfig;
pub use errors::{
    AlreadyInProgressError, ArchiveCorruptError, ChecksumMismatchError, CyclicDependencyError,
    RollbackFailedError, SerializationError, ValidationError,
};
pub use manifest::{Compression, Manifest, MediaAsset, TableEntry};
pub use memory::MemoryStore;
pub use progress::{Phase, ProgressView};
pub use restore::{RestoreMode, RestoreOptions, RestoreRecord, RestoreStatus, TableDelta};
pub use schema::{ForeignKey, SchemaDescriptor, StateStore, TableSpec};
pub use snapshot::{BackupOptions, SnapshotSummary, VerifyReport};
pub use value::{Row, Value};
pub use vault::{SharedStore, Vault};
