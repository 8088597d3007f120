//! Snapshot manifest (`index.json`) and snapshot listing.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::repo::write_atomic;
use crate::snapshot::SnapshotName;

pub const MANIFEST_FILE: &str = "index.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    pub name: String,
    pub size: u64,
    /// One entry per chunk; None = never written (reads as zeros).
    pub chunks: Vec<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub file: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub version: u32,
    pub snapshot: String,
    pub created_unix_ms: u64,
    pub chunk_size: u64,
    /// Fingerprint of the encryption key; None = unencrypted.
    #[serde(default)]
    pub key_fingerprint: Option<String>,
    pub images: Vec<ImageIndex>,
    #[serde(default)]
    pub configs: Vec<ConfigEntry>,
}

impl SnapshotManifest {
    pub fn image(&self, name: &str) -> Option<&ImageIndex> {
        self.images.iter().find(|i| i.name == name)
    }
}

pub fn write_manifest(dir: &Path, m: &SnapshotManifest) -> Result<()> {
    let data = serde_json::to_vec_pretty(m).context("serialize manifest")?;
    write_atomic(&dir.join(MANIFEST_FILE), &data)
}

pub fn read_manifest(dir: &Path) -> Result<SnapshotManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let m: SnapshotManifest =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if m.version != MANIFEST_VERSION {
        return Err(anyhow!(
            "unsupported manifest version {} in {}",
            m.version,
            path.display()
        ));
    }
    Ok(m)
}

/// All committed snapshots under `snapshots_root`, sorted by (type, id, time).
/// Entries without an index.json (incomplete or foreign) are skipped.
pub fn list_snapshots(snapshots_root: &Path) -> Result<Vec<SnapshotName>> {
    let mut out = Vec::new();
    if !snapshots_root.exists() {
        return Ok(out);
    }
    for t in read_dir_names(snapshots_root)? {
        let type_dir = snapshots_root.join(&t);
        for id in read_dir_names(&type_dir)? {
            let id_dir = type_dir.join(&id);
            for time in read_dir_names(&id_dir)? {
                if time.starts_with('.') || !id_dir.join(&time).join(MANIFEST_FILE).is_file() {
                    continue;
                }
                match SnapshotName::parse(&format!("{}/{}/{}", t, id, time)) {
                    Ok(n) => out.push(n),
                    Err(e) => log::debug!("list_snapshots: skip {}/{}/{}: {:#}", t, id, time, e),
                }
            }
        }
    }
    out.sort_by(|a, b| {
        (a.snapshot_type.as_str(), a.backup_id.as_str(), a.backup_time).cmp(&(
            b.snapshot_type.as_str(),
            b.backup_id.as_str(),
            b.backup_time,
        ))
    });
    Ok(out)
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for e in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let e = e?;
        if e.file_type()?.is_dir() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
