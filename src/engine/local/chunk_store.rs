//! Content-addressed chunk store: one blob per digest under `chunks/<aa>/<digest>`.
//! A blob is written once; inserting an existing digest is a dedup hit.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use super::repo::write_atomic;

pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn chunk_path(&self, digest: &str) -> PathBuf {
        let prefix = digest.get(..2).unwrap_or("xx");
        self.dir.join(prefix).join(digest)
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.chunk_path(digest).exists()
    }

    /// Store `blob` under `digest`. Returns false when the chunk was already present.
    pub fn insert(&self, digest: &str, blob: &[u8]) -> Result<bool> {
        let path = self.chunk_path(digest);
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        if let Err(e) = write_atomic(&path, blob) {
            // параллельная вставка того же чанка
            if path.exists() {
                return Ok(false);
            }
            return Err(e);
        }
        Ok(true)
    }

    pub fn load(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.chunk_path(digest);
        fs::read(&path).with_context(|| format!("read chunk {}", path.display()))
    }

    /// Number of stored chunks (walks the directory).
    pub fn count(&self) -> Result<usize> {
        let mut n = 0usize;
        if !self.dir.exists() {
            return Ok(0);
        }
        for sub in fs::read_dir(&self.dir).with_context(|| format!("read_dir {}", self.dir.display()))? {
            let sub = sub?;
            if !sub.file_type()?.is_dir() {
                continue;
            }
            for e in fs::read_dir(sub.path())? {
                let e = e?;
                let name = e.file_name();
                let name = name.to_string_lossy();
                if !name.ends_with(".tmp") {
                    n += 1;
                }
            }
        }
        Ok(n)
    }
}
