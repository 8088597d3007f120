//! In-process archive engine.
//!
//! Keeps committed snapshots in memory, records every call in order and can be told to fail
//! specific operations or to accept only part of each write. Used by the test-suite and for
//! dry runs of callers.
//!
//! Images are stored sparsely in 64 KiB pages; ranges never written read back as zeros.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::debug;

use super::{
    ArchiveEngine, BackupParams, BackupStreamId, Diagnostic, EngineResult, RestoreParams,
    RestoreStreamId,
};
use crate::snapshot::{canonical_name, BACKUP_SESSION_TYPE};

const PAGE: u64 = 64 * 1024;

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    NewBackup { repo: String, backup_id: String, backup_time: u64, chunk_size: u64 },
    ConnectBackup { session: u64 },
    AddConfig { session: u64, name: String, len: usize },
    RegisterImage { session: u64, name: String, size: u64 },
    WriteData { session: u64, stream: BackupStreamId, offset: u64, len: usize },
    CloseImage { session: u64, stream: BackupStreamId },
    Finish { session: u64 },
    Abort { session: u64, reason: String },
    DisconnectBackup { session: u64 },
    SnapshotName { snapshot_type: String, backup_id: String, backup_time: i64 },
    NewRestore { repo: String, snapshot: String },
    ConnectRestore { session: u64 },
    OpenImage { session: u64, name: String },
    ImageLength { session: u64, stream: RestoreStreamId },
    ReadAt { session: u64, stream: RestoreStreamId, offset: u64, len: usize },
    DisconnectRestore { session: u64 },
}

/// Operations that can be made to fail with [`MemoryEngine::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    NewBackup,
    ConnectBackup,
    AddConfig,
    RegisterImage,
    WriteData,
    CloseImage,
    Finish,
    SnapshotName,
    NewRestore,
    ConnectRestore,
    OpenImage,
    ImageLength,
    ReadAt,
}

/// Sparse fixed-size image.
struct SparseImage {
    size: u64,
    pages: Mutex<BTreeMap<u64, Box<[u8]>>>,
}

impl SparseImage {
    fn new(size: u64) -> Self {
        Self {
            size,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    fn write(&self, data: &[u8], offset: u64) {
        let mut pages = lock(&self.pages);
        let mut pos = 0usize;
        while pos < data.len() {
            let abs = offset + pos as u64;
            let idx = abs / PAGE;
            let in_page = (abs % PAGE) as usize;
            let take = (PAGE as usize - in_page).min(data.len() - pos);
            let page = pages
                .entry(idx)
                .or_insert_with(|| vec![0u8; PAGE as usize].into_boxed_slice());
            page[in_page..in_page + take].copy_from_slice(&data[pos..pos + take]);
            pos += take;
        }
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> usize {
        if offset >= self.size {
            return 0;
        }
        let n = (self.size - offset).min(buf.len() as u64) as usize;
        let pages = lock(&self.pages);
        let mut pos = 0usize;
        while pos < n {
            let abs = offset + pos as u64;
            let idx = abs / PAGE;
            let in_page = (abs % PAGE) as usize;
            let take = (PAGE as usize - in_page).min(n - pos);
            match pages.get(&idx) {
                Some(page) => buf[pos..pos + take].copy_from_slice(&page[in_page..in_page + take]),
                None => buf[pos..pos + take].fill(0),
            }
            pos += take;
        }
        n
    }

    fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size as usize];
        self.read(&mut out, 0);
        out
    }
}

struct StoredSnapshot {
    images: BTreeMap<String, Arc<SparseImage>>,
    configs: BTreeMap<String, Vec<u8>>,
}

struct BackupImage {
    name: String,
    data: Arc<SparseImage>,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Allocated,
    Connected,
    Finished,
    Aborted,
}

/// Engine state of a backup connection.
pub struct MemoryBackup {
    serial: u64,
    snapshot: String,
    chunk_size: u64,
    phase: Mutex<Phase>,
    images: RwLock<Vec<Arc<BackupImage>>>,
    configs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackup {
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn image(&self, stream: BackupStreamId) -> EngineResult<Arc<BackupImage>> {
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        images
            .get(stream.raw() as usize)
            .cloned()
            .ok_or_else(|| Diagnostic::new(format!("invalid stream {}", stream)))
    }

    fn require_phase(&self, want: Phase) -> EngineResult<()> {
        let phase = *lock(&self.phase);
        if phase != want {
            return Err(Diagnostic::new(format!(
                "backup session is {:?}, expected {:?}",
                phase, want
            )));
        }
        Ok(())
    }
}

/// Engine state of a restore connection.
pub struct MemoryRestore {
    serial: u64,
    snapshot: String,
    connected: AtomicBool,
    images: RwLock<BTreeMap<String, Arc<SparseImage>>>,
    streams: RwLock<Vec<Arc<SparseImage>>>,
}

impl MemoryRestore {
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    fn stream(&self, stream: RestoreStreamId) -> EngineResult<Arc<SparseImage>> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(stream.raw() as usize)
            .cloned()
            .ok_or_else(|| Diagnostic::new(format!("invalid stream {}", stream)))
    }
}

#[derive(Default)]
struct Inner {
    calls: Vec<EngineCall>,
    faults: HashMap<EngineOp, String>,
    max_write: Option<usize>,
    snapshots: BTreeMap<String, StoredSnapshot>,
}

#[derive(Default)]
pub struct MemoryEngine {
    inner: Mutex<Inner>,
    next_serial: AtomicU64,
    live_handles: AtomicUsize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `op` fail with `message` (until [`Self::clear_faults`]).
    pub fn fail_on(&self, op: EngineOp, message: &str) {
        lock(&self.inner).faults.insert(op, message.to_string());
    }

    pub fn clear_faults(&self) {
        lock(&self.inner).faults.clear();
    }

    /// Accept at most `max` bytes per `write_data` call (partial writes).
    pub fn set_max_write(&self, max: Option<usize>) {
        lock(&self.inner).max_write = max;
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn count_calls<F: Fn(&EngineCall) -> bool>(&self, pred: F) -> usize {
        lock(&self.inner).calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.inner).calls.clear();
    }

    /// Handles allocated and not yet disconnected.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        lock(&self.inner).snapshots.keys().cloned().collect()
    }

    /// Full contents of a committed image.
    pub fn image_bytes(&self, snapshot: &str, image: &str) -> Option<Vec<u8>> {
        let inner = lock(&self.inner);
        let snap = inner.snapshots.get(snapshot)?;
        snap.images.get(image).map(|img| img.to_vec())
    }

    pub fn config_bytes(&self, snapshot: &str, name: &str) -> Option<Vec<u8>> {
        let inner = lock(&self.inner);
        inner.snapshots.get(snapshot)?.configs.get(name).cloned()
    }

    /// Seed a committed image of `size` bytes whose first bytes are `contents`.
    pub fn insert_image(&self, snapshot: &str, image: &str, size: u64, contents: &[u8]) {
        let img = SparseImage::new(size);
        let n = (contents.len() as u64).min(size) as usize;
        if n > 0 {
            img.write(&contents[..n], 0);
        }
        let mut inner = lock(&self.inner);
        let snap = inner
            .snapshots
            .entry(snapshot.to_string())
            .or_insert_with(|| StoredSnapshot {
                images: BTreeMap::new(),
                configs: BTreeMap::new(),
            });
        snap.images.insert(image.to_string(), Arc::new(img));
    }

    // ----------------- internal helpers -----------------

    /// Record the call, then apply an injected fault for `op` if any.
    fn enter(&self, op: Option<EngineOp>, call: EngineCall) -> EngineResult<()> {
        let mut inner = lock(&self.inner);
        inner.calls.push(call);
        if let Some(op) = op {
            if let Some(msg) = inner.faults.get(&op) {
                return Err(Diagnostic::new(msg.clone()));
            }
        }
        Ok(())
    }

    fn serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ArchiveEngine for MemoryEngine {
    type Backup = MemoryBackup;
    type Restore = MemoryRestore;

    fn version(&self) -> String {
        format!("memory-engine {}", env!("CARGO_PKG_VERSION"))
    }

    fn default_chunk_size(&self) -> u64 {
        crate::DEFAULT_CHUNK_SIZE
    }

    fn new_backup_session(&self, params: &BackupParams, chunk_size: u64) -> EngineResult<MemoryBackup> {
        self.enter(
            Some(EngineOp::NewBackup),
            EngineCall::NewBackup {
                repo: params.repo.clone(),
                backup_id: params.backup_id.clone(),
                backup_time: params.backup_time,
                chunk_size,
            },
        )?;
        if chunk_size == 0 || !chunk_size.is_power_of_two() {
            return Err(Diagnostic::new(format!(
                "chunk size {} is not a power of two",
                chunk_size
            )));
        }
        let time = i64::try_from(params.backup_time)
            .map_err(|_| Diagnostic::new("backup time out of range"))?;
        let snapshot = canonical_name(BACKUP_SESSION_TYPE, &params.backup_id, time)?;

        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryBackup {
            serial: self.serial(),
            snapshot,
            chunk_size,
            phase: Mutex::new(Phase::Allocated),
            images: RwLock::new(Vec::new()),
            configs: Mutex::new(BTreeMap::new()),
        })
    }

    fn connect_backup(&self, h: &MemoryBackup) -> EngineResult<()> {
        self.enter(
            Some(EngineOp::ConnectBackup),
            EngineCall::ConnectBackup { session: h.serial },
        )?;
        if lock(&self.inner).snapshots.contains_key(&h.snapshot) {
            return Err(Diagnostic::new(format!(
                "backup snapshot '{}' already exists",
                h.snapshot
            )));
        }
        let mut phase = lock(&h.phase);
        if *phase != Phase::Allocated {
            return Err(Diagnostic::new("backup session already connected"));
        }
        *phase = Phase::Connected;
        Ok(())
    }

    fn add_config(&self, h: &MemoryBackup, name: &str, data: &[u8]) -> EngineResult<()> {
        self.enter(
            Some(EngineOp::AddConfig),
            EngineCall::AddConfig {
                session: h.serial,
                name: name.to_string(),
                len: data.len(),
            },
        )?;
        h.require_phase(Phase::Connected)?;
        let mut configs = lock(&h.configs);
        if configs.contains_key(name) {
            return Err(Diagnostic::new(format!("config '{}' already added", name)));
        }
        configs.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn register_image(&self, h: &MemoryBackup, name: &str, size: u64) -> EngineResult<BackupStreamId> {
        self.enter(
            Some(EngineOp::RegisterImage),
            EngineCall::RegisterImage {
                session: h.serial,
                name: name.to_string(),
                size,
            },
        )?;
        h.require_phase(Phase::Connected)?;
        let mut images = h.images.write().unwrap_or_else(PoisonError::into_inner);
        if images.iter().any(|i| i.name == name) {
            return Err(Diagnostic::new(format!("image '{}' already registered", name)));
        }
        let raw = u8::try_from(images.len())
            .map_err(|_| Diagnostic::new("too many images in one backup session"))?;
        images.push(Arc::new(BackupImage {
            name: name.to_string(),
            data: Arc::new(SparseImage::new(size)),
            closed: AtomicBool::new(false),
        }));
        Ok(BackupStreamId::new(raw))
    }

    fn write_data(
        &self,
        h: &MemoryBackup,
        stream: BackupStreamId,
        data: &[u8],
        offset: u64,
    ) -> EngineResult<usize> {
        self.enter(
            Some(EngineOp::WriteData),
            EngineCall::WriteData {
                session: h.serial,
                stream,
                offset,
                len: data.len(),
            },
        )?;
        h.require_phase(Phase::Connected)?;
        let img = h.image(stream)?;
        if img.closed.load(Ordering::SeqCst) {
            return Err(Diagnostic::new(format!("image '{}' is closed", img.name)));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Diagnostic::new("write range overflows"))?;
        if end > img.data.size {
            return Err(Diagnostic::new(format!(
                "write past end of image '{}' ({} > {})",
                img.name, end, img.data.size
            )));
        }
        let max = lock(&self.inner).max_write;
        let n = max.map(|m| m.min(data.len())).unwrap_or(data.len());
        img.data.write(&data[..n], offset);
        Ok(n)
    }

    fn close_image(&self, h: &MemoryBackup, stream: BackupStreamId) -> EngineResult<()> {
        self.enter(
            Some(EngineOp::CloseImage),
            EngineCall::CloseImage {
                session: h.serial,
                stream,
            },
        )?;
        h.require_phase(Phase::Connected)?;
        let img = h.image(stream)?;
        if img.closed.swap(true, Ordering::SeqCst) {
            return Err(Diagnostic::new(format!("image '{}' already closed", img.name)));
        }
        Ok(())
    }

    fn finish(&self, h: &MemoryBackup) -> EngineResult<()> {
        self.enter(Some(EngineOp::Finish), EngineCall::Finish { session: h.serial })?;
        let mut phase = lock(&h.phase);
        if *phase != Phase::Connected {
            return Err(Diagnostic::new(format!("cannot finish a {:?} session", *phase)));
        }
        let images = h.images.read().unwrap_or_else(PoisonError::into_inner);
        let open = images
            .iter()
            .filter(|i| !i.closed.load(Ordering::SeqCst))
            .count();
        if open > 0 {
            return Err(Diagnostic::new(format!("{} image(s) not closed", open)));
        }

        let stored = StoredSnapshot {
            images: images
                .iter()
                .map(|i| (i.name.clone(), i.data.clone()))
                .collect(),
            configs: lock(&h.configs).clone(),
        };
        lock(&self.inner).snapshots.insert(h.snapshot.clone(), stored);
        *phase = Phase::Finished;
        debug!("memory-engine: committed snapshot {}", h.snapshot);
        Ok(())
    }

    fn abort(&self, h: &MemoryBackup, reason: &str) {
        let _ = self.enter(
            None,
            EngineCall::Abort {
                session: h.serial,
                reason: reason.to_string(),
            },
        );
        *lock(&h.phase) = Phase::Aborted;
    }

    fn disconnect_backup(&self, h: MemoryBackup) {
        let _ = self.enter(None, EngineCall::DisconnectBackup { session: h.serial });
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }

    fn canonical_snapshot_name(&self, snapshot_type: &str, backup_id: &str, backup_time: i64) -> EngineResult<String> {
        self.enter(
            Some(EngineOp::SnapshotName),
            EngineCall::SnapshotName {
                snapshot_type: snapshot_type.to_string(),
                backup_id: backup_id.to_string(),
                backup_time,
            },
        )?;
        Ok(canonical_name(snapshot_type, backup_id, backup_time)?)
    }

    fn new_restore_session(&self, params: &RestoreParams, snapshot: &str) -> EngineResult<MemoryRestore> {
        self.enter(
            Some(EngineOp::NewRestore),
            EngineCall::NewRestore {
                repo: params.repo.clone(),
                snapshot: snapshot.to_string(),
            },
        )?;
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryRestore {
            serial: self.serial(),
            snapshot: snapshot.to_string(),
            connected: AtomicBool::new(false),
            images: RwLock::new(BTreeMap::new()),
            streams: RwLock::new(Vec::new()),
        })
    }

    fn connect_restore(&self, h: &MemoryRestore) -> EngineResult<()> {
        self.enter(
            Some(EngineOp::ConnectRestore),
            EngineCall::ConnectRestore { session: h.serial },
        )?;
        let inner = lock(&self.inner);
        let snap = inner
            .snapshots
            .get(&h.snapshot)
            .ok_or_else(|| Diagnostic::not_found(format!("snapshot '{}' not found", h.snapshot)))?;
        *h.images.write().unwrap_or_else(PoisonError::into_inner) = snap.images.clone();
        h.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn open_image(&self, h: &MemoryRestore, name: &str) -> EngineResult<RestoreStreamId> {
        self.enter(
            Some(EngineOp::OpenImage),
            EngineCall::OpenImage {
                session: h.serial,
                name: name.to_string(),
            },
        )?;
        if !h.connected.load(Ordering::SeqCst) {
            return Err(Diagnostic::new("restore session not connected"));
        }
        let img = h
            .images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Diagnostic::not_found(format!("image '{}' not in snapshot '{}'", name, h.snapshot))
            })?;
        let mut streams = h.streams.write().unwrap_or_else(PoisonError::into_inner);
        let raw = u8::try_from(streams.len())
            .map_err(|_| Diagnostic::new("too many open images"))?;
        streams.push(img);
        Ok(RestoreStreamId::new(raw))
    }

    fn image_length(&self, h: &MemoryRestore, stream: RestoreStreamId) -> EngineResult<u64> {
        self.enter(
            Some(EngineOp::ImageLength),
            EngineCall::ImageLength {
                session: h.serial,
                stream,
            },
        )?;
        Ok(h.stream(stream)?.size)
    }

    fn read_at(
        &self,
        h: &MemoryRestore,
        stream: RestoreStreamId,
        buf: &mut [u8],
        offset: u64,
    ) -> EngineResult<usize> {
        self.enter(
            Some(EngineOp::ReadAt),
            EngineCall::ReadAt {
                session: h.serial,
                stream,
                offset,
                len: buf.len(),
            },
        )?;
        Ok(h.stream(stream)?.read(buf, offset))
    }

    fn disconnect_restore(&self, h: MemoryRestore) {
        let _ = self.enter(None, EngineCall::DisconnectRestore { session: h.serial });
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_image_reads_zeros_and_data() {
        let img = SparseImage::new(PAGE * 3);
        img.write(&[7u8; 10], PAGE - 5);
        let mut buf = vec![0xFFu8; 20];
        let n = img.read(&mut buf, PAGE - 10);
        assert_eq!(n, 20);
        assert_eq!(&buf[..5], &[0u8; 5]);
        assert_eq!(&buf[5..15], &[7u8; 10]);
        assert_eq!(&buf[15..], &[0u8; 5]);
        assert_eq!(img.read(&mut buf, PAGE * 3), 0);
    }
}
