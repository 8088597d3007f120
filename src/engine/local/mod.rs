//! Directory-backed archive engine.
//!
//! The repository locator is a filesystem path holding a repository created with
//! [`LocalEngine::init_repo`]. Images are split into fixed-size chunks, chunks are stored
//! once per digest (dedup across images and snapshots), optionally compressed and encrypted.
//! A snapshot becomes visible only when `finish` renames its fully written directory into
//! place; an aborted or dropped session leaves nothing behind but unreferenced chunks.

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

mod blob;
mod chunk_store;
mod keys;
mod manifest;
mod reader;
mod repo;
mod writer;

pub use manifest::{ConfigEntry, ImageIndex, SnapshotManifest};
pub use repo::{InitOptions, RepoConfig};

use super::{
    ArchiveEngine, BackupParams, BackupStreamId, Diagnostic, EngineResult, RestoreParams,
    RestoreStreamId,
};
use crate::snapshot::{canonical_name, SnapshotName, BACKUP_SESSION_TYPE};
use keys::ChunkKey;
use reader::ImageReadState;
use repo::Repo;
use writer::ImageWriteState;

pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LocalEngine {
    default_chunk_size: u64,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self {
            default_chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk size used when the caller does not pick one.
    pub fn with_default_chunk_size(mut self, chunk_size: u64) -> anyhow::Result<Self> {
        check_chunk_size(chunk_size)?;
        self.default_chunk_size = chunk_size;
        Ok(self)
    }

    /// Create an empty repository at `root`.
    pub fn init_repo(root: &Path, opts: &InitOptions) -> anyhow::Result<()> {
        repo::init_repo(root, opts)?;
        info!("local engine: initialized repository {}", root.display());
        Ok(())
    }

    /// Committed snapshots of the repository at `root`, sorted.
    pub fn list_snapshots(root: &Path) -> anyhow::Result<Vec<SnapshotName>> {
        let repo = Repo::open(root)?;
        manifest::list_snapshots(&repo.snapshots_root())
    }

    /// Manifest of one committed snapshot.
    pub fn read_manifest(root: &Path, snapshot: &SnapshotName) -> anyhow::Result<SnapshotManifest> {
        let repo = Repo::open(root)?;
        manifest::read_manifest(&repo.snapshot_dir(snapshot))
    }

    /// Config blob `name` attached to a committed snapshot, decrypted with `key` if given.
    pub fn read_config(
        root: &Path,
        snapshot: &SnapshotName,
        name: &str,
        key: Option<&super::KeyMaterial>,
    ) -> anyhow::Result<Vec<u8>> {
        let repo = Repo::open(root)?;
        let dir = repo.snapshot_dir(snapshot);
        let m = manifest::read_manifest(&dir)?;
        let entry = m
            .configs
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow!("config '{}' not found in {}", name, snapshot))?;
        let key = load_key(key)?;
        let bytes = fs::read(dir.join(&entry.file))
            .with_context(|| format!("read {}", dir.join(&entry.file).display()))?;
        blob::decode_blob(&bytes, key.as_ref())
    }

    /// Number of distinct chunks stored in the repository at `root`.
    pub fn chunk_count(root: &Path) -> anyhow::Result<usize> {
        Repo::open(root)?.chunk_store().count()
    }
}

fn check_chunk_size(chunk_size: u64) -> anyhow::Result<()> {
    if !chunk_size.is_power_of_two() || !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(anyhow!(
            "invalid chunk size {} (power of two in {}..={})",
            chunk_size,
            MIN_CHUNK_SIZE,
            MAX_CHUNK_SIZE
        ));
    }
    Ok(())
}

fn load_key(key: Option<&super::KeyMaterial>) -> anyhow::Result<Option<ChunkKey>> {
    key.map(ChunkKey::load).transpose()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Allocated,
    Connected,
    Finished,
    Aborted,
}

/// Backup handle state.
pub struct LocalBackup {
    root: PathBuf,
    snapshot: SnapshotName,
    chunk_size: u64,
    password: String,
    key: Option<ChunkKey>,
    repo: OnceLock<Repo>,
    phase: Mutex<Phase>,
    images: RwLock<Vec<Arc<Mutex<ImageWriteState>>>>,
    configs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl LocalBackup {
    fn repo(&self) -> anyhow::Result<&Repo> {
        self.repo
            .get()
            .ok_or_else(|| anyhow!("backup session is not connected"))
    }

    fn require_connected(&self) -> anyhow::Result<()> {
        match *lock(&self.phase) {
            Phase::Connected => Ok(()),
            p => Err(anyhow!("backup session is not connected ({:?})", p)),
        }
    }

    fn image(&self, stream: BackupStreamId) -> anyhow::Result<Arc<Mutex<ImageWriteState>>> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream.raw() as usize)
            .cloned()
            .ok_or_else(|| anyhow!("unknown image stream {}", stream))
    }

    fn commit(&self) -> anyhow::Result<()> {
        let repo = self.repo()?;
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        let mut indexes = Vec::with_capacity(images.len());
        for img in images.iter() {
            let img = lock(img);
            if !img.is_closed() {
                return Err(anyhow!("image '{}' is still open", img.name()));
            }
            let st = img.stats();
            debug!(
                "local engine: '{}' stored={} reused={} zero={}",
                img.name(),
                st.chunks_stored,
                st.chunks_reused,
                st.zero_chunks
            );
            indexes.push(img.index());
        }

        let _guard = repo.lock_exclusive()?;
        let final_dir = repo.snapshot_dir(&self.snapshot);
        if final_dir.exists() {
            return Err(anyhow!("backup snapshot '{}' already exists", self.snapshot));
        }
        let parent = final_dir
            .parent()
            .ok_or_else(|| anyhow!("bad snapshot path {}", final_dir.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let tmp_dir = parent.join(format!(
            ".tmp-{}-{}",
            self.snapshot.time_string(),
            std::process::id()
        ));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).with_context(|| format!("remove {}", tmp_dir.display()))?;
        }
        fs::create_dir_all(&tmp_dir).with_context(|| format!("create {}", tmp_dir.display()))?;

        let res = self.write_snapshot_files(&tmp_dir, indexes).and_then(|_| {
            fs::rename(&tmp_dir, &final_dir).with_context(|| {
                format!("rename {} -> {}", tmp_dir.display(), final_dir.display())
            })
        });
        if res.is_err() {
            let _ = fs::remove_dir_all(&tmp_dir);
        }
        res
    }

    fn write_snapshot_files(&self, dir: &Path, images: Vec<ImageIndex>) -> anyhow::Result<()> {
        let configs = lock(&self.configs);
        let mut entries = Vec::with_capacity(configs.len());
        for (name, data) in configs.iter() {
            let file = format!("{}.blob", name);
            let blob = blob::encode_blob(data, self.key.as_ref())?;
            repo::write_atomic(&dir.join(&file), &blob)?;
            entries.push(ConfigEntry {
                name: name.clone(),
                file,
                size: data.len() as u64,
            });
        }
        let m = SnapshotManifest {
            version: manifest::MANIFEST_VERSION,
            snapshot: self.snapshot.to_string(),
            created_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            chunk_size: self.chunk_size,
            key_fingerprint: self.key.as_ref().map(ChunkKey::fingerprint),
            images,
            configs: entries,
        };
        manifest::write_manifest(dir, &m)
    }
}

impl Drop for LocalBackup {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Restore handle state.
pub struct LocalRestore {
    root: PathBuf,
    snapshot: SnapshotName,
    password: String,
    key: Option<ChunkKey>,
    repo: OnceLock<Repo>,
    manifest: OnceLock<SnapshotManifest>,
    streams: RwLock<Vec<Arc<ImageReadState>>>,
}

impl LocalRestore {
    fn connected(&self) -> anyhow::Result<(&Repo, &SnapshotManifest)> {
        match (self.repo.get(), self.manifest.get()) {
            (Some(r), Some(m)) => Ok((r, m)),
            _ => Err(anyhow!("restore session is not connected")),
        }
    }

    fn stream(&self, stream: RestoreStreamId) -> anyhow::Result<Arc<ImageReadState>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream.raw() as usize)
            .cloned()
            .ok_or_else(|| anyhow!("unknown image stream {}", stream))
    }
}

impl Drop for LocalRestore {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl ArchiveEngine for LocalEngine {
    type Backup = LocalBackup;
    type Restore = LocalRestore;

    fn version(&self) -> String {
        format!(
            "local-engine {} (repo format {})",
            env!("CARGO_PKG_VERSION"),
            repo::REPO_FORMAT_VERSION
        )
    }

    fn default_chunk_size(&self) -> u64 {
        self.default_chunk_size
    }

    fn new_backup_session(&self, params: &BackupParams, chunk_size: u64) -> EngineResult<LocalBackup> {
        check_chunk_size(chunk_size)?;
        let time = i64::try_from(params.backup_time)
            .map_err(|_| Diagnostic::new("backup time out of range"))?;
        let snapshot = SnapshotName::new(BACKUP_SESSION_TYPE, &params.backup_id, time)?;
        if params.fingerprint.is_some() {
            debug!("local engine: fingerprint ignored for local repository");
        }
        let key = load_key(params.key.as_ref())?;
        Ok(LocalBackup {
            root: PathBuf::from(&params.repo),
            snapshot,
            chunk_size,
            password: params.password.clone(),
            key,
            repo: OnceLock::new(),
            phase: Mutex::new(Phase::Allocated),
            images: RwLock::new(Vec::new()),
            configs: Mutex::new(BTreeMap::new()),
        })
    }

    fn connect_backup(&self, h: &LocalBackup) -> EngineResult<()> {
        let mut phase = lock(&h.phase);
        if *phase != Phase::Allocated {
            return Err(Diagnostic::new("backup session already connected"));
        }
        let repo = Repo::open(&h.root)?;
        repo.authenticate(&h.password)?;
        if repo.snapshot_dir(&h.snapshot).exists() {
            return Err(Diagnostic::new(format!(
                "backup snapshot '{}' already exists",
                h.snapshot
            )));
        }
        let _ = h.repo.set(repo);
        *phase = Phase::Connected;
        debug!("local engine: backup {} connected to {}", h.snapshot, h.root.display());
        Ok(())
    }

    fn add_config(&self, h: &LocalBackup, name: &str, data: &[u8]) -> EngineResult<()> {
        h.require_connected()?;
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(Diagnostic::new(format!("invalid config name '{}'", name)));
        }
        let mut configs = lock(&h.configs);
        if configs.contains_key(name) {
            return Err(Diagnostic::new(format!("config '{}' already added", name)));
        }
        configs.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn register_image(&self, h: &LocalBackup, name: &str, size: u64) -> EngineResult<BackupStreamId> {
        h.require_connected()?;
        let mut images = h.images.write().unwrap_or_else(PoisonError::into_inner);
        if images.iter().any(|i| lock(i).name() == name) {
            return Err(Diagnostic::new(format!("image '{}' already registered", name)));
        }
        let raw = u8::try_from(images.len())
            .map_err(|_| Diagnostic::new("too many images in one backup session"))?;
        images.push(Arc::new(Mutex::new(ImageWriteState::new(name, size, h.chunk_size)?)));
        Ok(BackupStreamId::new(raw))
    }

    fn write_data(
        &self,
        h: &LocalBackup,
        stream: BackupStreamId,
        data: &[u8],
        offset: u64,
    ) -> EngineResult<usize> {
        h.require_connected()?;
        let store = h.repo()?.chunk_store();
        let img = h.image(stream)?;
        lock(&img).write(&store, h.key.as_ref(), data, offset)?;
        Ok(data.len())
    }

    fn close_image(&self, h: &LocalBackup, stream: BackupStreamId) -> EngineResult<()> {
        h.require_connected()?;
        let store = h.repo()?.chunk_store();
        let img = h.image(stream)?;
        lock(&img).close(&store, h.key.as_ref())?;
        Ok(())
    }

    fn finish(&self, h: &LocalBackup) -> EngineResult<()> {
        let mut phase = lock(&h.phase);
        if *phase != Phase::Connected {
            return Err(Diagnostic::new(format!(
                "cannot finish backup session ({:?})",
                *phase
            )));
        }
        h.commit()?;
        *phase = Phase::Finished;
        info!("local engine: committed snapshot {}", h.snapshot);
        Ok(())
    }

    fn abort(&self, h: &LocalBackup, reason: &str) {
        let mut phase = lock(&h.phase);
        if matches!(*phase, Phase::Finished | Phase::Aborted) {
            return;
        }
        *phase = Phase::Aborted;
        for img in h.images.read().unwrap_or_else(PoisonError::into_inner).iter() {
            lock(img).discard();
        }
        warn!("local engine: backup {} aborted: {}", h.snapshot, reason);
    }

    fn disconnect_backup(&self, h: LocalBackup) {
        if *lock(&h.phase) == Phase::Connected {
            debug!("local engine: discarding unfinished backup {}", h.snapshot);
        }
    }

    fn canonical_snapshot_name(
        &self,
        snapshot_type: &str,
        backup_id: &str,
        backup_time: i64,
    ) -> EngineResult<String> {
        Ok(canonical_name(snapshot_type, backup_id, backup_time)?)
    }

    fn new_restore_session(&self, params: &RestoreParams, snapshot: &str) -> EngineResult<LocalRestore> {
        let snapshot = SnapshotName::parse(snapshot)?;
        let key = load_key(params.key.as_ref())?;
        Ok(LocalRestore {
            root: PathBuf::from(&params.repo),
            snapshot,
            password: params.password.clone(),
            key,
            repo: OnceLock::new(),
            manifest: OnceLock::new(),
            streams: RwLock::new(Vec::new()),
        })
    }

    fn connect_restore(&self, h: &LocalRestore) -> EngineResult<()> {
        if h.repo.get().is_some() {
            return Err(Diagnostic::new("restore session already connected"));
        }
        let repo = Repo::open(&h.root)?;
        repo.authenticate(&h.password)?;
        let dir = repo.snapshot_dir(&h.snapshot);
        if !dir.join(manifest::MANIFEST_FILE).is_file() {
            return Err(Diagnostic::not_found(format!(
                "snapshot '{}' not found in {}",
                h.snapshot,
                h.root.display()
            )));
        }
        let m = manifest::read_manifest(&dir)?;
        match (&m.key_fingerprint, &h.key) {
            (Some(_), None) => {
                return Err(Diagnostic::new(format!(
                    "snapshot '{}' is encrypted, a key is required",
                    h.snapshot
                )))
            }
            (Some(fp), Some(k)) if *fp != k.fingerprint() => {
                return Err(Diagnostic::new(format!(
                    "wrong key for snapshot '{}' (fingerprint {} != {})",
                    h.snapshot,
                    k.fingerprint(),
                    fp
                )))
            }
            (None, Some(_)) => {
                debug!("local engine: snapshot {} is not encrypted, key unused", h.snapshot)
            }
            _ => {}
        }
        let _ = h.repo.set(repo);
        let _ = h.manifest.set(m);
        debug!("local engine: restore {} connected", h.snapshot);
        Ok(())
    }

    fn open_image(&self, h: &LocalRestore, name: &str) -> EngineResult<RestoreStreamId> {
        let (_, m) = h.connected()?;
        let index = m.image(name).cloned().ok_or_else(|| {
            Diagnostic::not_found(format!("image '{}' not found in {}", name, h.snapshot))
        })?;
        let mut streams = h.streams.write().unwrap_or_else(PoisonError::into_inner);
        let raw = u8::try_from(streams.len())
            .map_err(|_| Diagnostic::new("too many open images in one restore session"))?;
        streams.push(Arc::new(ImageReadState::new(index, m.chunk_size)));
        Ok(RestoreStreamId::new(raw))
    }

    fn image_length(&self, h: &LocalRestore, stream: RestoreStreamId) -> EngineResult<u64> {
        Ok(h.stream(stream)?.size())
    }

    fn read_at(
        &self,
        h: &LocalRestore,
        stream: RestoreStreamId,
        buf: &mut [u8],
        offset: u64,
    ) -> EngineResult<usize> {
        let (repo, _) = h.connected()?;
        let store = repo.chunk_store();
        Ok(h.stream(stream)?.read_at(&store, h.key.as_ref(), buf, offset)?)
    }

    fn disconnect_restore(&self, h: LocalRestore) {
        debug!("local engine: restore {} released", h.snapshot);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
