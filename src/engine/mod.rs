//! Archive engine contract.
//!
//! The engine does chunking, dedup, encryption and transport; the session layer only drives
//! it. Every fallible call returns an owned [`Diagnostic`] on failure.
//!
//! Handle state is engine-defined (`Backup` / `Restore` associated types). The session layer
//! owns it exclusively and gives it back through `disconnect_*` exactly once.
//!
//! Shipped engines:
//! - [`memory::MemoryEngine`]: in-process, records calls, injects faults (tests, dry runs).
//! - [`local::LocalEngine`]: directory repository with content-addressed chunks.

use std::fmt;

mod diag;
mod params;

pub mod local;
pub mod memory;

pub use diag::{Diagnostic, DiagnosticKind, EngineResult};
pub use params::{BackupParams, KeyMaterial, RestoreParams};

/// Stream id of an image registered in a backup session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupStreamId(u8);

impl BackupStreamId {
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }
    pub fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for BackupStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Stream id of an image opened in a restore session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RestoreStreamId(u8);

impl RestoreStreamId {
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }
    pub fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for RestoreStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Archive engine used by [`BackupSession`](crate::BackupSession) and
/// [`RestoreSession`](crate::RestoreSession).
///
/// Independent stream operations may be called concurrently for one handle. Lifecycle calls
/// (connect, finish, abort, disconnect) are serialised by the session layer.
pub trait ArchiveEngine: Send + Sync {
    /// Engine-side state of a backup connection.
    type Backup: Send + Sync;
    /// Engine-side state of a restore connection.
    type Restore: Send + Sync;

    /// Informational engine version string.
    fn version(&self) -> String;

    /// Chunk size used when the caller does not override it.
    fn default_chunk_size(&self) -> u64;

    // ----- backup -----

    fn new_backup_session(&self, params: &BackupParams, chunk_size: u64) -> EngineResult<Self::Backup>;

    fn connect_backup(&self, h: &Self::Backup) -> EngineResult<()>;

    fn add_config(&self, h: &Self::Backup, name: &str, data: &[u8]) -> EngineResult<()>;

    fn register_image(&self, h: &Self::Backup, name: &str, size: u64) -> EngineResult<BackupStreamId>;

    /// Returns the number of bytes accepted; may be less than `data.len()`.
    fn write_data(
        &self,
        h: &Self::Backup,
        stream: BackupStreamId,
        data: &[u8],
        offset: u64,
    ) -> EngineResult<usize>;

    fn close_image(&self, h: &Self::Backup, stream: BackupStreamId) -> EngineResult<()>;

    fn finish(&self, h: &Self::Backup) -> EngineResult<()>;

    /// Best-effort; failures are not reported.
    fn abort(&self, h: &Self::Backup, reason: &str);

    fn disconnect_backup(&self, h: Self::Backup);

    // ----- restore -----

    /// Canonical snapshot name for (type, id, time); the naming scheme belongs to the engine.
    fn canonical_snapshot_name(&self, snapshot_type: &str, backup_id: &str, backup_time: i64) -> EngineResult<String>;

    fn new_restore_session(&self, params: &RestoreParams, snapshot: &str) -> EngineResult<Self::Restore>;

    fn connect_restore(&self, h: &Self::Restore) -> EngineResult<()>;

    fn open_image(&self, h: &Self::Restore, name: &str) -> EngineResult<RestoreStreamId>;

    fn image_length(&self, h: &Self::Restore, stream: RestoreStreamId) -> EngineResult<u64>;

    /// Reads up to `buf.len()` bytes at `offset`; returns 0 at or past the end.
    fn read_at(
        &self,
        h: &Self::Restore,
        stream: RestoreStreamId,
        buf: &mut [u8],
        offset: u64,
    ) -> EngineResult<usize>;

    fn disconnect_restore(&self, h: Self::Restore);
}
