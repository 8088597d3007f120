use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::engine::{ArchiveEngine, BackupStreamId};
use crate::error::{Result, SessionError};
use crate::metrics::{record_bytes_written, record_local_rejection};

use super::BackupSession;

/// A registered, fixed-size image inside a [`BackupSession`].
///
/// Borrows the session, so it cannot outlive it. Writes at overlapping offsets of the same
/// image from several threads are not serialised; keep them disjoint.
pub struct ImageWriter<'s, E: ArchiveEngine> {
    session: &'s BackupSession<E>,
    name: String,
    stream: BackupStreamId,
    size: u64,
    closed: AtomicBool,
}

impl<'s, E: ArchiveEngine> ImageWriter<'s, E> {
    pub(super) fn new(session: &'s BackupSession<E>, name: String, stream: BackupStreamId, size: u64) -> Self {
        Self {
            session,
            name,
            stream,
            size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> BackupStreamId {
        self.stream
    }

    /// Declared size fixed at registration.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write `data` at `offset`. Returns the number of bytes the engine accepted, which may be
    /// less than `data.len()`; the remainder is not retried here (see [`Self::write_all_at`]).
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            record_local_rejection();
            return Err(SessionError::invalid(format!(
                "empty write to image '{}'",
                self.name
            )));
        }
        let len = data.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => {
                record_local_rejection();
                return Err(SessionError::Range {
                    image: self.name.clone(),
                    offset,
                    len,
                    size: self.size,
                });
            }
        }

        // shared lock: finish/abort/close ждут завершения этой записи
        let st = self.session.read_state();
        if self.is_closed() {
            record_local_rejection();
            return Err(SessionError::AlreadyClosed(self.name.clone()));
        }
        self.session.require_connected("write_data", *st)?;
        let handle = self.session.handle();
        let h = handle.state()?;
        let n = handle
            .engine()
            .write_data(h, self.stream, data, offset)
            .map_err(|d| SessionError::protocol("write_data", d))?;
        if n > data.len() {
            return Err(SessionError::state(
                "write_data",
                format!("engine reported {} bytes written for a {} byte payload", n, data.len()),
            ));
        }

        record_bytes_written(n);
        Ok(n)
    }

    /// Write all of `data` at `offset`, looping over partial writes.
    pub fn write_all_at(&self, mut data: &[u8], mut offset: u64) -> Result<()> {
        while !data.is_empty() {
            let n = self.write_at(data, offset)?;
            if n == 0 {
                return Err(SessionError::state(
                    "write_data",
                    format!("engine accepted 0 bytes at offset {} of image '{}'", offset, self.name),
                ));
            }
            data = &data[n..];
            offset += n as u64;
        }
        Ok(())
    }

    /// Finalise the image with the engine. A second call fails with `AlreadyClosed`.
    /// If the engine rejects the close, the image stays open and the call may be repeated.
    ///
    /// Writes already in flight complete first; writes issued after this call starts fail
    /// with `AlreadyClosed` and never reach the engine.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            record_local_rejection();
            return Err(SessionError::AlreadyClosed(self.name.clone()));
        }

        let res = self.close_inner();
        match res {
            Ok(()) => {
                self.session.writer_closed();
                debug!("backup: closed image '{}' stream={}", self.name, self.stream);
                Ok(())
            }
            Err(e) => {
                self.closed.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn close_inner(&self) -> Result<()> {
        // exclusive: ни одна запись не должна пройти мимо флага closed
        let st = self.session.write_state();
        self.session.require_connected("close_image", *st)?;
        let handle = self.session.handle();
        let h = handle.state()?;
        handle
            .engine()
            .close_image(h, self.stream)
            .map_err(|d| SessionError::protocol("close_image", d))
    }
}

impl<E: ArchiveEngine> Drop for ImageWriter<'_, E> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!(
                "backup: image '{}' dropped without close; the session cannot finish",
                self.name
            );
        }
    }
}
