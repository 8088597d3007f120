//! Lightweight global metrics for the session layer.
//!
//! Потокобезопасные атомарные счётчики:
//! - backup sessions (opened / finished / aborted)
//! - restore sessions (opened)
//! - images (registered / opened) and payload bytes
//! - local rejections (range / argument / state checks that never reached the engine)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Backup -----
static BACKUP_SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static BACKUP_SESSIONS_FINISHED: AtomicU64 = AtomicU64::new(0);
static BACKUP_SESSIONS_ABORTED: AtomicU64 = AtomicU64::new(0);
static IMAGES_REGISTERED: AtomicU64 = AtomicU64::new(0);
static CONFIGS_ATTACHED: AtomicU64 = AtomicU64::new(0);
static BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ----- Restore -----
static RESTORE_SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static IMAGES_OPENED: AtomicU64 = AtomicU64::new(0);
static BYTES_READ: AtomicU64 = AtomicU64::new(0);

// ----- Validation -----
static LOCAL_REJECTIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub backup_sessions_opened: u64,
    pub backup_sessions_finished: u64,
    pub backup_sessions_aborted: u64,
    pub images_registered: u64,
    pub configs_attached: u64,
    pub bytes_written: u64,

    pub restore_sessions_opened: u64,
    pub images_opened: u64,
    pub bytes_read: u64,

    pub local_rejections: u64,
}

impl MetricsSnapshot {
    /// Share of backup sessions that ended in abort.
    pub fn abort_ratio(&self) -> f64 {
        let ended = self.backup_sessions_finished + self.backup_sessions_aborted;
        if ended == 0 {
            0.0
        } else {
            self.backup_sessions_aborted as f64 / ended as f64
        }
    }
}

pub fn record_backup_opened() {
    BACKUP_SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_backup_finished() {
    BACKUP_SESSIONS_FINISHED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_backup_aborted() {
    BACKUP_SESSIONS_ABORTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_image_registered() {
    IMAGES_REGISTERED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_config_attached() {
    CONFIGS_ATTACHED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_bytes_written(n: usize) {
    BYTES_WRITTEN.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_restore_opened() {
    RESTORE_SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_image_opened() {
    IMAGES_OPENED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_bytes_read(n: usize) {
    BYTES_READ.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_local_rejection() {
    LOCAL_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        backup_sessions_opened: BACKUP_SESSIONS_OPENED.load(Ordering::Relaxed),
        backup_sessions_finished: BACKUP_SESSIONS_FINISHED.load(Ordering::Relaxed),
        backup_sessions_aborted: BACKUP_SESSIONS_ABORTED.load(Ordering::Relaxed),
        images_registered: IMAGES_REGISTERED.load(Ordering::Relaxed),
        configs_attached: CONFIGS_ATTACHED.load(Ordering::Relaxed),
        bytes_written: BYTES_WRITTEN.load(Ordering::Relaxed),
        restore_sessions_opened: RESTORE_SESSIONS_OPENED.load(Ordering::Relaxed),
        images_opened: IMAGES_OPENED.load(Ordering::Relaxed),
        bytes_read: BYTES_READ.load(Ordering::Relaxed),
        local_rejections: LOCAL_REJECTIONS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    BACKUP_SESSIONS_OPENED.store(0, Ordering::Relaxed);
    BACKUP_SESSIONS_FINISHED.store(0, Ordering::Relaxed);
    BACKUP_SESSIONS_ABORTED.store(0, Ordering::Relaxed);
    IMAGES_REGISTERED.store(0, Ordering::Relaxed);
    CONFIGS_ATTACHED.store(0, Ordering::Relaxed);
    BYTES_WRITTEN.store(0, Ordering::Relaxed);
    RESTORE_SESSIONS_OPENED.store(0, Ordering::Relaxed);
    IMAGES_OPENED.store(0, Ordering::Relaxed);
    BYTES_READ.store(0, Ordering::Relaxed);
    LOCAL_REJECTIONS.store(0, Ordering::Relaxed);
}
