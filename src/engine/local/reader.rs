//! Per-image read state. Keeps the last decoded chunk cached.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, PoisonError};

use super::blob::decode_blob;
use super::chunk_store::ChunkStore;
use super::keys::{chunk_digest, ChunkKey};
use super::manifest::ImageIndex;

pub struct ImageReadState {
    index: ImageIndex,
    chunk_size: u64,
    cache: Mutex<Option<(usize, Arc<Vec<u8>>)>>,
}

impl ImageReadState {
    pub fn new(index: ImageIndex, chunk_size: u64) -> Self {
        Self {
            index,
            chunk_size,
            cache: Mutex::new(None),
        }
    }

    pub fn size(&self) -> u64 {
        self.index.size
    }

    pub fn read_at(
        &self,
        store: &ChunkStore,
        key: Option<&ChunkKey>,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        if offset >= self.index.size {
            return Ok(0);
        }
        let n = (self.index.size - offset).min(buf.len() as u64) as usize;
        let mut pos = 0usize;
        while pos < n {
            let abs = offset + pos as u64;
            let idx = (abs / self.chunk_size) as usize;
            let in_chunk = (abs % self.chunk_size) as usize;
            let chunk_len = (self.index.size - idx as u64 * self.chunk_size).min(self.chunk_size) as usize;
            let take = (chunk_len - in_chunk).min(n - pos);

            match self.index.chunks.get(idx) {
                Some(Some(digest)) => {
                    let data = self.chunk(idx, digest, store, key)?;
                    if data.len() != chunk_len {
                        return Err(anyhow!(
                            "chunk {} of '{}' has length {}, expected {}",
                            idx,
                            self.index.name,
                            data.len(),
                            chunk_len
                        ));
                    }
                    buf[pos..pos + take].copy_from_slice(&data[in_chunk..in_chunk + take]);
                }
                Some(None) => buf[pos..pos + take].fill(0),
                None => {
                    return Err(anyhow!(
                        "index of '{}' is missing chunk {}",
                        self.index.name,
                        idx
                    ))
                }
            }
            pos += take;
        }
        Ok(n)
    }

    fn chunk(
        &self,
        idx: usize,
        digest: &str,
        store: &ChunkStore,
        key: Option<&ChunkKey>,
    ) -> Result<Arc<Vec<u8>>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, data)) = cache.as_ref() {
            if *cached == idx {
                return Ok(data.clone());
            }
        }
        let raw = decode_blob(&store.load(digest)?, key)?;
        if chunk_digest(key, &raw)? != digest {
            return Err(anyhow!("chunk {} is corrupted (digest mismatch)", digest));
        }
        let data = Arc::new(raw);
        *cache = Some((idx, data.clone()));
        Ok(data)
    }
}
