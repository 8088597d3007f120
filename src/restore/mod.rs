//! Restore session: resolve the snapshot name, allocate restore-mode state, connect; then open
//! images for offset-addressed reads.

mod image;

pub use image::ImageReader;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};

use crate::config::SessionConfig;
use crate::engine::{ArchiveEngine, RestoreParams};
use crate::error::{Result, SessionError};
use crate::handle::{Handle, RestoreMode};
use crate::metrics::{record_image_opened, record_local_rejection, record_restore_opened};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Created,
    Connected,
    Closed,
}

pub struct RestoreSession<E: ArchiveEngine> {
    handle: Handle<E, RestoreMode>,
    repo: String,
    snapshot: String,
    state: RwLock<RestoreState>,
}

impl<E: ArchiveEngine> RestoreSession<E> {
    /// Resolve `(type, id, time)` to the engine's snapshot name, allocate, connect.
    /// Any failing step aborts the open; nothing allocated is kept.
    pub fn open(engine: Arc<E>, params: &RestoreParams) -> Result<Self> {
        if params.repo.trim().is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid("repository must not be empty"));
        }
        let time = i64::try_from(params.backup_time).map_err(|_| {
            record_local_rejection();
            SessionError::invalid(format!("backup time {} out of range", params.backup_time))
        })?;

        let snapshot = engine
            .canonical_snapshot_name(&params.snapshot_type, &params.backup_id, time)
            .map_err(|d| SessionError::InvalidArgument(d.into_message()))?;

        info!(
            "restore: open repo={}, snapshot={}, encrypted={}",
            params.repo,
            snapshot,
            params.key.is_some()
        );

        let state = engine
            .new_restore_session(params, &snapshot)
            .map_err(|d| SessionError::connection("new_restore_session", d))?;

        let session = Self {
            handle: Handle::new(engine, state),
            repo: params.repo.clone(),
            snapshot,
            state: RwLock::new(RestoreState::Created),
        };
        session.connect()?;

        record_restore_opened();
        Ok(session)
    }

    /// Open from a [`SessionConfig`] and a snapshot triple.
    pub fn open_with_config(
        engine: Arc<E>,
        cfg: &SessionConfig,
        snapshot_type: &str,
        backup_id: &str,
        backup_time: u64,
    ) -> Result<Self> {
        let params = cfg.restore_params(snapshot_type, backup_id, backup_time)?;
        Self::open(engine, &params)
    }

    fn connect(&self) -> Result<()> {
        let mut st = self.write_state();
        if *st != RestoreState::Created {
            return Err(SessionError::state(
                "connect_restore",
                format!("cannot connect from state {:?}", *st),
            ));
        }
        let h = self.handle.state()?;
        self.handle
            .engine()
            .connect_restore(h)
            .map_err(|d| SessionError::connection("connect_restore", d))?;
        *st = RestoreState::Connected;
        debug!("restore: connected snapshot={}", self.snapshot);
        Ok(())
    }

    /// Open a named image of the snapshot.
    pub fn open_image(&self, name: &str) -> Result<ImageReader<'_, E>> {
        if name.trim().is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid("image name must not be empty"));
        }
        let st = self.read_state();
        self.require_connected("open_image", *st)?;
        let h = self.handle.state()?;
        let stream = self
            .handle
            .engine()
            .open_image(h, name)
            .map_err(|d| SessionError::lookup("open_image", name, d))?;

        record_image_opened();
        debug!("restore: opened image '{}' stream={}", name, stream);
        Ok(ImageReader::new(self, name.to_string(), stream))
    }

    /// Release the connection. Consumes the session.
    pub fn disconnect(mut self) {
        *self.write_state() = RestoreState::Closed;
        self.handle.release();
        debug!("restore: disconnected snapshot={}", self.snapshot);
    }

    pub fn state(&self) -> RestoreState {
        *self.read_state()
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Canonical snapshot name as resolved by the engine.
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    // ----------------- internal helpers -----------------

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, RestoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RestoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn require_connected(&self, op: &'static str, st: RestoreState) -> Result<()> {
        let msg = match st {
            RestoreState::Connected => return Ok(()),
            RestoreState::Created => "session is not connected",
            RestoreState::Closed => "session is closed",
        };
        record_local_rejection();
        Err(SessionError::state(op, msg))
    }

    pub(crate) fn handle(&self) -> &Handle<E, RestoreMode> {
        &self.handle
    }
}
