//! Whole-image streaming between `std::io` byte streams and image writers/readers.

use std::io::{self, Read, Write};

use log::debug;

use crate::backup::ImageWriter;
use crate::engine::ArchiveEngine;
use crate::error::{Result, SessionError};
use crate::restore::ImageReader;

/// Default block size for the streaming helpers (4 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Copy `src` into `writer` from offset 0 in blocks of `block_size` bytes.
/// Returns the number of bytes written. A source longer than the declared image size fails with
/// `Range` before the overflowing block is sent.
pub fn upload_image<E: ArchiveEngine, R: Read>(
    writer: &ImageWriter<'_, E>,
    mut src: R,
    block_size: usize,
) -> Result<u64> {
    if block_size == 0 {
        return Err(SessionError::invalid("block size must be > 0"));
    }
    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all_at(&buf[..n], offset)?;
        offset += n as u64;
    }

    debug!(
        "transfer: uploaded {} B into '{}' (size {})",
        offset,
        writer.name(),
        writer.size()
    );
    Ok(offset)
}

/// Copy the whole image behind `reader` into `dst`. Returns the number of bytes copied.
pub fn download_image<E: ArchiveEngine, W: Write>(
    reader: &ImageReader<'_, E>,
    mut dst: W,
    block_size: usize,
) -> Result<u64> {
    if block_size == 0 {
        return Err(SessionError::invalid("block size must be > 0"));
    }
    let len = reader.length()?;
    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;

    while offset < len {
        let want = (len - offset).min(block_size as u64) as usize;
        let n = reader.read_at(&mut buf[..want], offset)?;
        if n == 0 {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "image '{}' ended at offset {} of {}",
                    reader.name(),
                    offset,
                    len
                ),
            )));
        }
        dst.write_all(&buf[..n])?;
        offset += n as u64;
    }
    dst.flush()?;

    debug!("transfer: downloaded {} B from '{}'", offset, reader.name());
    Ok(offset)
}
