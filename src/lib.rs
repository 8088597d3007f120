//! Backup/restore session manager over a chunked, deduplicating archive engine.
//!
//! The crate drives an [`ArchiveEngine`] (chunking, dedup, encryption, transport) through
//! explicit session lifecycles:
//!
//! - [`BackupSession`]: open → attach configs / register images → write → close → finish | abort.
//! - [`RestoreSession`]: open (canonical snapshot name → allocate → connect) → open images →
//!   positional reads.
//!
//! Engines shipped here: [`MemoryEngine`] (in-process, recording) and [`LocalEngine`]
//! (directory repository).

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod restore;
pub mod snapshot;
pub mod transfer;

pub use backup::{BackupSession, ImageWriter, SessionState};
pub use config::{ConfigBuilder, SessionConfig};
pub use engine::local::{InitOptions, LocalEngine};
pub use engine::memory::{EngineCall, EngineOp, MemoryEngine};
pub use engine::{
    ArchiveEngine, BackupParams, BackupStreamId, Diagnostic, DiagnosticKind, EngineResult,
    KeyMaterial, RestoreParams, RestoreStreamId,
};
pub use error::{Result, SessionError};
pub use restore::{ImageReader, RestoreSession, RestoreState};
pub use snapshot::SnapshotName;

/// Chunk size used by the bundled engines when none is configured (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Version string reported by `engine`.
pub fn engine_version<E: ArchiveEngine>(engine: &E) -> String {
    engine.version()
}

/// Chunk size `engine` uses when a session does not set one.
pub fn default_chunk_size<E: ArchiveEngine>(engine: &E) -> u64 {
    engine.default_chunk_size()
}
