use std::io;
use std::sync::OnceLock;

use crate::engine::{ArchiveEngine, RestoreStreamId};
use crate::error::{Result, SessionError};
use crate::metrics::record_bytes_read;

use super::RestoreSession;

/// An opened image of a [`RestoreSession`]. Reads may run concurrently.
pub struct ImageReader<'s, E: ArchiveEngine> {
    session: &'s RestoreSession<E>,
    name: String,
    stream: RestoreStreamId,
    // Lazy cache of the length reported by the engine
    length: OnceLock<u64>,
}

impl<'s, E: ArchiveEngine> ImageReader<'s, E> {
    pub(super) fn new(session: &'s RestoreSession<E>, name: String, stream: RestoreStreamId) -> Self {
        Self {
            session,
            name,
            stream,
            length: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> RestoreStreamId {
        self.stream
    }

    /// Size of the image as recorded in the snapshot.
    pub fn length(&self) -> Result<u64> {
        if let Some(&len) = self.length.get() {
            return Ok(len);
        }
        let st = self.session.read_state();
        self.session.require_connected("image_length", *st)?;
        let handle = self.session.handle();
        let h = handle.state()?;
        let len = handle
            .engine()
            .image_length(h, self.stream)
            .map_err(|d| SessionError::protocol("image_length", d))?;
        Ok(*self.length.get_or_init(|| len))
    }

    /// Read up to `buf.len()` bytes at `offset`. Short reads happen at end of image; reads at
    /// or past the end return 0.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = self.length()?;
        if offset >= len {
            return Ok(0);
        }
        let want = (len - offset).min(buf.len() as u64) as usize;

        let st = self.session.read_state();
        self.session.require_connected("read_at", *st)?;
        let handle = self.session.handle();
        let h = handle.state()?;
        let n = handle
            .engine()
            .read_at(h, self.stream, &mut buf[..want], offset)
            .map_err(|d| SessionError::protocol("read_at", d))?;
        if n > want {
            return Err(SessionError::state(
                "read_at",
                format!("engine reported {} bytes read into a {} byte buffer", n, want),
            ));
        }

        record_bytes_read(n);
        Ok(n)
    }

    /// Fill `buf` completely from `offset` or fail with `UnexpectedEof`.
    pub fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            let n = self.read_at(buf, offset)?;
            if n == 0 {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("image '{}' ended at offset {}", self.name, offset),
                )));
            }
            buf = &mut buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}
