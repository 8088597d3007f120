//! Backup session: Created → Connected → (register / attach)* → Finished | Aborted.
//!
//! Lifecycle transitions and registrations take the state lock exclusively, so they are
//! serialised per handle. Image writes take it shared: writes on different images run in
//! parallel, and `finish`/`abort` wait for in-flight writes to return.

mod image;

pub use image::ImageWriter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{ArchiveEngine, BackupParams};
use crate::error::{Result, SessionError};
use crate::handle::{BackupMode, Handle};
use crate::metrics::{
    record_backup_aborted, record_backup_finished, record_backup_opened, record_config_attached,
    record_image_registered, record_local_rejection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Engine state allocated, not connected yet.
    Created,
    Connected,
    Finished,
    Aborted,
}

pub struct BackupSession<E: ArchiveEngine> {
    handle: Handle<E, BackupMode>,
    repo: String,
    backup_id: String,
    backup_time: u64,
    chunk_size: u64,
    state: RwLock<SessionState>,
    open_writers: AtomicUsize,
}

impl<E: ArchiveEngine> BackupSession<E> {
    /// Allocate backup-mode engine state and connect.
    ///
    /// Allocation failure: no connect is attempted. Connect failure: the allocated state is
    /// handed back to the engine before the error is returned.
    pub fn open(engine: Arc<E>, params: &BackupParams) -> Result<Self> {
        if params.repo.trim().is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid("repository must not be empty"));
        }
        if params.backup_id.trim().is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid("backup id must not be empty"));
        }
        let chunk_size = params
            .chunk_size
            .unwrap_or_else(|| engine.default_chunk_size());

        info!(
            "backup: open repo={}, id={}, time={}, chunk_size={}, encrypted={}",
            params.repo,
            params.backup_id,
            params.backup_time,
            chunk_size,
            params.key.is_some()
        );

        let state = engine
            .new_backup_session(params, chunk_size)
            .map_err(|d| SessionError::connection("new_backup_session", d))?;

        let session = Self {
            handle: Handle::new(engine, state),
            repo: params.repo.clone(),
            backup_id: params.backup_id.clone(),
            backup_time: params.backup_time,
            chunk_size,
            state: RwLock::new(SessionState::Created),
            open_writers: AtomicUsize::new(0),
        };
        // при ошибке session дропается → handle освобождается
        session.connect()?;

        record_backup_opened();
        Ok(session)
    }

    /// Open from a [`SessionConfig`] (repository, credentials, key material, chunk size).
    pub fn open_with_config(engine: Arc<E>, cfg: &SessionConfig, backup_id: &str, backup_time: u64) -> Result<Self> {
        let params = cfg.backup_params(backup_id, backup_time)?;
        Self::open(engine, &params)
    }

    fn connect(&self) -> Result<()> {
        let mut st = self.write_state();
        if *st != SessionState::Created {
            return Err(SessionError::state(
                "connect_backup",
                format!("cannot connect from state {:?}", *st),
            ));
        }
        let h = self.handle.state()?;
        self.handle
            .engine()
            .connect_backup(h)
            .map_err(|d| SessionError::connection("connect_backup", d))?;
        *st = SessionState::Connected;
        debug!("backup: connected id={} time={}", self.backup_id, self.backup_time);
        Ok(())
    }

    /// Transmit a named configuration blob to be stored with the backup.
    pub fn attach_config(&self, name: &str, data: &[u8]) -> Result<()> {
        if name.trim().is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid("config name must not be empty"));
        }
        if data.is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid(format!("config '{}' has an empty payload", name)));
        }

        let st = self.write_state();
        self.require_connected("add_config", *st)?;
        let h = self.handle.state()?;
        self.handle
            .engine()
            .add_config(h, name, data)
            .map_err(|d| SessionError::protocol("add_config", d))?;

        record_config_attached();
        debug!("backup: attached config '{}' ({} B)", name, data.len());
        Ok(())
    }

    /// Register a new image of exactly `size` bytes.
    pub fn register_image(&self, name: &str, size: u64) -> Result<ImageWriter<'_, E>> {
        if name.trim().is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid("image name must not be empty"));
        }

        let st = self.write_state();
        self.require_connected("register_image", *st)?;
        let h = self.handle.state()?;
        let stream = self
            .handle
            .engine()
            .register_image(h, name, size)
            .map_err(|d| SessionError::protocol("register_image", d))?;
        self.open_writers.fetch_add(1, Ordering::SeqCst);

        record_image_registered();
        debug!("backup: registered image '{}' size={} stream={}", name, size, stream);
        Ok(ImageWriter::new(self, name.to_string(), stream, size))
    }

    /// Commit the session. Every registered image must be closed first.
    pub fn finish(&self) -> Result<()> {
        let mut st = self.write_state();
        self.require_connected("finish", *st)?;

        let open = self.open_writers.load(Ordering::SeqCst);
        if open > 0 {
            record_local_rejection();
            return Err(SessionError::state(
                "finish",
                format!("{} image(s) still open", open),
            ));
        }

        let h = self.handle.state()?;
        self.handle
            .engine()
            .finish(h)
            .map_err(|d| SessionError::protocol("finish", d))?;
        *st = SessionState::Finished;

        record_backup_finished();
        info!("backup: finished id={} time={}", self.backup_id, self.backup_time);
        Ok(())
    }

    /// Discard the session. The engine is notified best-effort; the only error is calling
    /// this outside the Connected state (after finish or a previous abort).
    pub fn abort(&self, reason: &str) -> Result<()> {
        let mut st = self.write_state();
        self.require_connected("abort", *st)?;

        let h = self.handle.state()?;
        self.handle.engine().abort(h, reason);
        *st = SessionState::Aborted;

        record_backup_aborted();
        warn!(
            "backup: aborted id={} time={}: {}",
            self.backup_id, self.backup_time, reason
        );
        Ok(())
    }

    /// Release the connection. Consumes the session.
    pub fn disconnect(mut self) {
        let st = *self.read_state();
        if st == SessionState::Connected {
            warn!(
                "backup: disconnect id={} without finish or abort; engine discards the session",
                self.backup_id
            );
        }
        self.handle.release();
        debug!("backup: disconnected id={} state={:?}", self.backup_id, st);
    }

    pub fn state(&self) -> SessionState {
        *self.read_state()
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn backup_time(&self) -> u64 {
        self.backup_time
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Images registered and not yet closed.
    pub fn open_writers(&self) -> usize {
        self.open_writers.load(Ordering::SeqCst)
    }

    // ----------------- internal helpers -----------------

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn require_connected(&self, op: &'static str, st: SessionState) -> Result<()> {
        let msg = match st {
            SessionState::Connected => return Ok(()),
            SessionState::Created => "session is not connected",
            SessionState::Finished => "session is already finished",
            SessionState::Aborted => "session was aborted",
        };
        record_local_rejection();
        Err(SessionError::state(op, msg))
    }

    pub(crate) fn handle(&self) -> &Handle<E, BackupMode> {
        &self.handle
    }

    pub(crate) fn writer_closed(&self) {
        self.open_writers.fetch_sub(1, Ordering::SeqCst);
    }
}
