//! Local repository layout and metadata.
//!
//! Layout:
//!   <repo>/repo.json                     — format version, password verifier
//!   <repo>/LOCK                          — advisory lock (fs2), held while committing
//!   <repo>/chunks/<aa>/<digest>          — chunk blobs (see blob.rs)
//!   <repo>/snapshots/<type>/<id>/<time>/ — index.json + config blobs

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::chunk_store::ChunkStore;
use super::hex_encode;
use crate::snapshot::SnapshotName;

pub const REPO_FORMAT_VERSION: u32 = 1;
const REPO_CONFIG_FILE: &str = "repo.json";
const LOCK_FILE: &str = "LOCK";
const PASSWORD_SALT_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub created_unix_ms: u64,
    /// hex(SHA-256(salt || password)); None = no authentication.
    #[serde(default)]
    pub password_sha256: Option<String>,
    #[serde(default)]
    pub password_salt: Option<String>,
}

/// Options for [`init_repo`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Require this password on every connect.
    pub password: Option<String>,
}

pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
}

/// Lock over the repository; released on Drop.
pub struct RepoLock {
    file: fs::File,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Create an empty repository at `root` (directory may exist but must not hold a repo).
pub fn init_repo(root: &Path, opts: &InitOptions) -> Result<()> {
    let cfg_path = root.join(REPO_CONFIG_FILE);
    if cfg_path.exists() {
        return Err(anyhow!("repository already exists at {}", root.display()));
    }
    fs::create_dir_all(root.join("chunks"))
        .with_context(|| format!("create {}", root.join("chunks").display()))?;
    fs::create_dir_all(root.join("snapshots"))
        .with_context(|| format!("create {}", root.join("snapshots").display()))?;

    let created_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let (password_sha256, password_salt) = match opts.password.as_deref() {
        Some(pw) => {
            let mut salt = [0u8; PASSWORD_SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            let salt = hex_encode(&salt);
            (Some(password_verifier(&salt, pw)), Some(salt))
        }
        None => (None, None),
    };

    let cfg = RepoConfig {
        version: REPO_FORMAT_VERSION,
        created_unix_ms,
        password_sha256,
        password_salt,
    };
    let data = serde_json::to_vec_pretty(&cfg).context("serialize repo.json")?;
    write_atomic(&cfg_path, &data)?;
    Ok(())
}

impl Repo {
    pub fn open(root: &Path) -> Result<Self> {
        let cfg_path = root.join(REPO_CONFIG_FILE);
        let bytes = fs::read(&cfg_path)
            .with_context(|| format!("no repository at {} (read {})", root.display(), cfg_path.display()))?;
        let config: RepoConfig = serde_json::from_slice(&bytes).context("parse repo.json")?;
        if config.version != REPO_FORMAT_VERSION {
            return Err(anyhow!(
                "unsupported repository format version {} (expected {})",
                config.version,
                REPO_FORMAT_VERSION
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn authenticate(&self, password: &str) -> Result<()> {
        match (&self.config.password_sha256, &self.config.password_salt) {
            (Some(expected), Some(salt)) => {
                if password_verifier(salt, password) != *expected {
                    return Err(anyhow!("authentication failed for {}", self.root.display()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn chunk_store(&self) -> ChunkStore {
        ChunkStore::new(self.root.join("chunks"))
    }

    pub fn snapshots_root(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_dir(&self, name: &SnapshotName) -> PathBuf {
        self.snapshots_root().join(name.rel_path())
    }

    /// Exclusive repository lock (blocks until acquired).
    pub fn lock_exclusive(&self) -> Result<RepoLock> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock_exclusive {}", path.display()))?;
        Ok(RepoLock { file })
    }
}

fn password_verifier(salt: &str, password: &str) -> String {
    let mut h = Sha256::new();
    h.update(salt.as_bytes());
    h.update(password.as_bytes());
    hex_encode(&h.finalize())
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write through tmp+rename; the tmp name is unique per call.
pub(super) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}-{}.tmp", std::process::id(), seq));
    let tmp = path.with_file_name(tmp_name);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .with_context(|| format!("open {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("write {}", tmp.display()))?;
        let _ = f.sync_all();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
