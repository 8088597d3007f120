//! Per-image write state: fixed-size chunking with eager flush.
//!
//! A chunk is buffered until every byte of it has been written, then hashed, encoded and
//! stored; only its digest stays in memory. Writing into an already flushed chunk reloads it.
//! Chunks still partial at close are flushed with the gaps zero-filled. All-zero chunks are
//! not stored at all.
//!
//! At most `MAX_PENDING_CHUNKS` partial chunks are buffered per image; past that the lowest
//! partial chunk is flushed early (zero-filled gaps, reloaded if written again later).

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use super::blob::{decode_blob, encode_blob};
use super::chunk_store::ChunkStore;
use super::keys::{chunk_digest, ChunkKey};
use super::manifest::ImageIndex;

/// Partial chunks kept in memory per image before the oldest is flushed.
const MAX_PENDING_CHUNKS: usize = 16;

struct PendingChunk {
    data: Vec<u8>,
    /// Sorted, non-overlapping, non-adjacent [start, end) ranges already written.
    covered: Vec<(usize, usize)>,
}

impl PendingChunk {
    fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            covered: Vec::new(),
        }
    }

    fn loaded(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data,
            covered: vec![(0, len)],
        }
    }

    fn cover(&mut self, start: usize, end: usize) {
        let mut s = start;
        let mut e = end;
        let mut out = Vec::with_capacity(self.covered.len() + 1);
        for &(a, b) in &self.covered {
            if b < s || a > e {
                out.push((a, b));
            } else {
                s = s.min(a);
                e = e.max(b);
            }
        }
        out.push((s, e));
        out.sort_unstable();
        self.covered = out;
    }

    fn is_full(&self) -> bool {
        self.covered.len() == 1 && self.covered[0] == (0, self.data.len())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    pub chunks_stored: u64,
    pub chunks_reused: u64,
    pub zero_chunks: u64,
}

pub struct ImageWriteState {
    name: String,
    size: u64,
    chunk_size: u64,
    chunks: Vec<Option<String>>,
    pending: BTreeMap<usize, PendingChunk>,
    closed: bool,
    stats: WriteStats,
    max_pending: usize,
}

impl ImageWriteState {
    pub fn new(name: &str, size: u64, chunk_size: u64) -> Result<Self> {
        let count = usize::try_from(size.div_ceil(chunk_size))
            .map_err(|_| anyhow!("image '{}' too large ({} bytes)", name, size))?;
        Ok(Self {
            name: name.to_string(),
            size,
            chunk_size,
            chunks: vec![None; count],
            pending: BTreeMap::new(),
            closed: false,
            stats: WriteStats::default(),
            max_pending: MAX_PENDING_CHUNKS,
        })
    }

    #[cfg(test)]
    fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    fn chunk_len(&self, idx: usize) -> usize {
        let start = idx as u64 * self.chunk_size;
        (self.size - start).min(self.chunk_size) as usize
    }

    pub fn write(
        &mut self,
        store: &ChunkStore,
        key: Option<&ChunkKey>,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        if self.closed {
            return Err(anyhow!("image '{}' is closed", self.name));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| anyhow!("write range overflows"))?;
        if end > self.size {
            return Err(anyhow!(
                "write past end of image '{}' ({} > {})",
                self.name,
                end,
                self.size
            ));
        }

        let mut pos = 0usize;
        while pos < data.len() {
            let abs = offset + pos as u64;
            let idx = (abs / self.chunk_size) as usize;
            let in_chunk = (abs % self.chunk_size) as usize;
            let len = self.chunk_len(idx);
            let take = (len - in_chunk).min(data.len() - pos);

            if !self.pending.contains_key(&idx) {
                let chunk = match &self.chunks[idx] {
                    // перезапись уже сброшенного чанка
                    Some(digest) => PendingChunk::loaded(decode_blob(&store.load(digest)?, key)?),
                    None => PendingChunk::zeroed(len),
                };
                self.pending.insert(idx, chunk);
            }
            let full = match self.pending.get_mut(&idx) {
                Some(chunk) => {
                    chunk.data[in_chunk..in_chunk + take].copy_from_slice(&data[pos..pos + take]);
                    chunk.cover(in_chunk, in_chunk + take);
                    chunk.is_full()
                }
                None => false,
            };
            if full {
                self.flush_chunk(idx, store, key)?;
            } else {
                self.evict_partial(idx, store, key)?;
            }
            pos += take;
        }
        Ok(())
    }

    /// Flush partial chunks other than `keep` until the buffer is within bounds.
    fn evict_partial(&mut self, keep: usize, store: &ChunkStore, key: Option<&ChunkKey>) -> Result<()> {
        while self.pending.len() > self.max_pending {
            let victim = match self.pending.keys().copied().find(|&i| i != keep) {
                Some(i) => i,
                None => break,
            };
            self.flush_chunk(victim, store, key)?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self, idx: usize, store: &ChunkStore, key: Option<&ChunkKey>) -> Result<()> {
        let chunk = match self.pending.remove(&idx) {
            Some(c) => c,
            None => return Ok(()),
        };
        if chunk.data.iter().all(|&b| b == 0) {
            self.chunks[idx] = None;
            self.stats.zero_chunks += 1;
            return Ok(());
        }
        let digest = chunk_digest(key, &chunk.data)?;
        if store.contains(&digest) {
            self.stats.chunks_reused += 1;
        } else {
            let blob = encode_blob(&chunk.data, key)?;
            if store.insert(&digest, &blob)? {
                self.stats.chunks_stored += 1;
            } else {
                self.stats.chunks_reused += 1;
            }
        }
        self.chunks[idx] = Some(digest);
        Ok(())
    }

    /// Flush everything still buffered and refuse further writes.
    pub fn close(&mut self, store: &ChunkStore, key: Option<&ChunkKey>) -> Result<()> {
        if self.closed {
            return Err(anyhow!("image '{}' already closed", self.name));
        }
        let pending: Vec<usize> = self.pending.keys().copied().collect();
        for idx in pending {
            self.flush_chunk(idx, store, key)?;
        }
        self.closed = true;
        Ok(())
    }

    /// Drop buffered data without storing it.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.closed = true;
    }

    pub fn index(&self) -> ImageIndex {
        ImageIndex {
            name: self.name.clone(),
            size: self.size,
            chunks: self.chunks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::reader::ImageReadState;

    #[test]
    fn cover_merges_overlapping_and_adjacent_ranges() {
        let mut c = PendingChunk::zeroed(100);
        c.cover(10, 20);
        c.cover(30, 40);
        assert_eq!(c.covered, vec![(10, 20), (30, 40)]);
        c.cover(20, 30);
        assert_eq!(c.covered, vec![(10, 40)]);
        c.cover(0, 10);
        c.cover(40, 100);
        assert!(c.is_full());
    }

    #[test]
    fn sparse_writes_keep_pending_bounded() {
        const CS: u64 = 65536;
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path().to_path_buf());
        let mut w = ImageWriteState::new("disk0", CS * 8, CS).unwrap().with_max_pending(2);

        // один сектор в каждом чанке
        for i in 0..8u64 {
            w.write(&store, None, &[0xAB; 512], i * CS + 100).unwrap();
            assert!(w.pending.len() <= 2);
        }
        // одинаковое содержимое: один блоб, остальные дедуплицированы
        let st = w.stats();
        assert_eq!((st.chunks_stored, st.chunks_reused), (1, 5));

        // дописываем уже сброшенный чанк 0
        w.write(&store, None, &[0xCD; 512], 4096).unwrap();
        w.close(&store, None).unwrap();

        let reader = ImageReadState::new(w.index(), CS);
        let mut buf = vec![0u8; CS as usize];
        reader.read_at(&store, None, &mut buf, 0).unwrap();
        assert!(buf[..100].iter().all(|&b| b == 0));
        assert!(buf[100..612].iter().all(|&b| b == 0xAB));
        assert!(buf[612..4096].iter().all(|&b| b == 0));
        assert!(buf[4096..4608].iter().all(|&b| b == 0xCD));
        assert!(buf[4608..].iter().all(|&b| b == 0));

        reader.read_at(&store, None, &mut buf, 7 * CS).unwrap();
        assert!(buf[100..612].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn image_chunk_count_rounds_up() {
        let w = ImageWriteState::new("disk0", 65536 * 2 + 1, 65536).unwrap();
        assert_eq!(w.chunks.len(), 3);
        assert_eq!(w.chunk_len(2), 1);
        let empty = ImageWriteState::new("empty", 0, 65536).unwrap();
        assert!(empty.chunks.is_empty());
    }
}
