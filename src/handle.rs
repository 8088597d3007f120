//! Single-owner wrapper around engine connection state.
//!
//! A `Handle` is created from a successful `new_*_session` call and hands the state back to the
//! engine (`disconnect_*`) exactly once: on explicit [`Handle::release`] or on drop. It is not
//! `Clone`, so a connection has exactly one owner.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;

use crate::engine::ArchiveEngine;
use crate::error::{Result, SessionError};

/// Connection mode of a handle; ties the engine state type to its release call.
pub trait HandleMode<E: ArchiveEngine> {
    type State: Send + Sync;
    const NAME: &'static str;
    fn disconnect(engine: &E, state: Self::State);
}

/// Backup-mode connection.
pub struct BackupMode;

/// Restore-mode connection.
pub struct RestoreMode;

impl<E: ArchiveEngine> HandleMode<E> for BackupMode {
    type State = E::Backup;
    const NAME: &'static str = "backup";
    fn disconnect(engine: &E, state: E::Backup) {
        engine.disconnect_backup(state);
    }
}

impl<E: ArchiveEngine> HandleMode<E> for RestoreMode {
    type State = E::Restore;
    const NAME: &'static str = "restore";
    fn disconnect(engine: &E, state: E::Restore) {
        engine.disconnect_restore(state);
    }
}

pub struct Handle<E: ArchiveEngine, M: HandleMode<E>> {
    engine: Arc<E>,
    state: Option<M::State>,
    _mode: PhantomData<M>,
}

impl<E: ArchiveEngine, M: HandleMode<E>> Handle<E, M> {
    pub(crate) fn new(engine: Arc<E>, state: M::State) -> Self {
        Self {
            engine,
            state: Some(state),
            _mode: PhantomData,
        }
    }

    pub fn mode(&self) -> &'static str {
        M::NAME
    }

    pub fn is_live(&self) -> bool {
        self.state.is_some()
    }

    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }

    /// Engine state; fails loudly once the handle has been released.
    pub(crate) fn state(&self) -> Result<&M::State> {
        self.state.as_ref().ok_or_else(|| SessionError::Connection {
            op: "handle",
            message: format!("{} handle already released", M::NAME),
        })
    }

    /// Give the state back to the engine. Later calls are no-ops.
    pub(crate) fn release(&mut self) {
        if let Some(state) = self.state.take() {
            debug!("handle: disconnect {} connection", M::NAME);
            M::disconnect(&self.engine, state);
        }
    }
}

impl<E: ArchiveEngine, M: HandleMode<E>> Drop for Handle<E, M> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: ArchiveEngine, M: HandleMode<E>> fmt::Debug for Handle<E, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("mode", &M::NAME)
            .field("live", &self.is_live())
            .finish()
    }
}
