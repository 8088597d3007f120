//! Centralized connection configuration for backup/restore sessions.
//!
//! Goals:
//! - Single place to collect repository, credentials and key material instead of passing
//!   seven positional strings around.
//! - `SessionConfig::from_env()` reads the usual PBS_* variables.
//! - `SessionConfig::load(path)` reads a JSON file (missing fields fall back to defaults).
//! - `ConfigBuilder` for programmatic setups.
//!
//! ENV:
//!   PBS_REPOSITORY    — repository locator (remote store or local path)
//!   PBS_PASSWORD      — authentication secret
//!   PBS_FINGERPRINT   — expected server certificate fingerprint
//!   PBS_KEYFILE       — encryption key file
//!   PBS_KEY_PASSWORD  — passphrase for the key file
//!   PBS_CHUNK_SIZE    — chunk size override in bytes

use anyhow::Context;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use zeroize::Zeroize;

use crate::engine::{BackupParams, KeyMaterial, RestoreParams};
use crate::error::{Result, SessionError};

#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Repository locator. Env: PBS_REPOSITORY
    pub repository: String,

    /// Authentication secret. Env: PBS_PASSWORD
    pub password: String,

    /// Expected server fingerprint (transport trust). Env: PBS_FINGERPRINT
    pub fingerprint: Option<String>,

    /// Encryption key file; None = unencrypted. Env: PBS_KEYFILE
    pub key_file: Option<String>,

    /// Passphrase of the key file. Env: PBS_KEY_PASSWORD
    pub key_password: Option<String>,

    /// Chunk size override; None = engine default. Env: PBS_CHUNK_SIZE
    pub chunk_size: Option<u64>,
}

/// On-disk form of [`SessionConfig`]; `SessionConfig` zeroizes on Drop, so fields are moved
/// out of this one instead.
#[derive(Default, Deserialize)]
#[serde(default)]
struct RawSessionConfig {
    repository: String,
    password: String,
    fingerprint: Option<String>,
    key_file: Option<String>,
    key_password: Option<String>,
    chunk_size: Option<u64>,
}

impl From<RawSessionConfig> for SessionConfig {
    fn from(raw: RawSessionConfig) -> Self {
        Self {
            repository: raw.repository,
            password: raw.password,
            fingerprint: raw.fingerprint,
            key_file: raw.key_file,
            key_password: raw.key_password,
            chunk_size: raw.chunk_size,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_nonempty("PBS_REPOSITORY") {
            cfg.repository = v;
        }
        if let Ok(v) = std::env::var("PBS_PASSWORD") {
            cfg.password = v;
        }
        cfg.fingerprint = env_nonempty("PBS_FINGERPRINT");
        cfg.key_file = env_nonempty("PBS_KEYFILE");
        cfg.key_password = env_nonempty("PBS_KEY_PASSWORD");

        if let Some(v) = env_nonempty("PBS_CHUNK_SIZE") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.chunk_size = Some(n);
            }
        }

        cfg
    }

    /// Read a JSON config file, e.g.
    /// `{"repository":"/srv/backup","password":"...","key_file":"/etc/pbs/key"}`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let raw: RawSessionConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(raw.into())
    }

    pub fn with_repository<S: Into<String>>(mut self, repo: S) -> Self {
        self.repository = repo.into();
        self
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_fingerprint<S: Into<String>>(mut self, fp: Option<S>) -> Self {
        self.fingerprint = fp.map(Into::into);
        self
    }

    pub fn with_key_file<S: Into<String>>(mut self, key_file: Option<S>) -> Self {
        self.key_file = key_file.map(Into::into);
        self
    }

    pub fn with_key_password<S: Into<String>>(mut self, pw: Option<S>) -> Self {
        self.key_password = pw.map(Into::into);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<u64>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Key material when a key file is configured.
    pub fn key_material(&self) -> Option<KeyMaterial> {
        self.key_file.as_ref().map(|f| KeyMaterial {
            key_file: f.clone(),
            key_password: self.key_password.clone(),
        })
    }

    pub fn backup_params(&self, backup_id: &str, backup_time: u64) -> Result<BackupParams> {
        self.check_repository()?;
        Ok(BackupParams::new(
            self.repository.as_str(),
            backup_id,
            backup_time,
            self.password.as_str(),
        )
        .with_fingerprint(self.fingerprint.clone())
        .with_key(self.key_material())
        .with_chunk_size(self.chunk_size))
    }

    pub fn restore_params(&self, snapshot_type: &str, backup_id: &str, backup_time: u64) -> Result<RestoreParams> {
        self.check_repository()?;
        Ok(RestoreParams::new(
            self.repository.as_str(),
            snapshot_type,
            backup_id,
            backup_time,
            self.password.as_str(),
        )
        .with_fingerprint(self.fingerprint.clone())
        .with_key(self.key_material()))
    }

    fn check_repository(&self) -> Result<()> {
        if self.repository.trim().is_empty() {
            return Err(SessionError::invalid(
                "no repository configured (set PBS_REPOSITORY or SessionConfig::repository)",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionConfig {{ \
             repository: {}, \
             password: {}, \
             fingerprint: {}, \
             key_file: {}, \
             key_password: {}, \
             chunk_size: {} \
             }}",
            self.repository,
            if self.password.is_empty() { "(none)" } else { "***" },
            self.fingerprint.as_deref().unwrap_or("(none)"),
            self.key_file.as_deref().unwrap_or("(unencrypted)"),
            if self.key_password.is_some() { "***" } else { "(none)" },
            self.chunk_size
                .map(|v| v.to_string())
                .unwrap_or_else(|| "default(engine)".to_string()),
        )
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Drop for SessionConfig {
    fn drop(&mut self) {
        self.password.zeroize();
        if let Some(p) = self.key_password.as_mut() {
            p.zeroize();
        }
    }
}

/// Builder producing a [`SessionConfig`]; starts from the environment.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cfg: SessionConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            cfg: SessionConfig::from_env(),
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: SessionConfig::default(),
        }
    }

    pub fn repository<S: Into<String>>(mut self, repo: S) -> Self {
        self.cfg.repository = repo.into();
        self
    }

    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.cfg.password = password.into();
        self
    }

    pub fn fingerprint<S: Into<String>>(mut self, fp: Option<S>) -> Self {
        self.cfg.fingerprint = fp.map(Into::into);
        self
    }

    pub fn key_file<S: Into<String>>(mut self, key_file: Option<S>) -> Self {
        self.cfg.key_file = key_file.map(Into::into);
        self
    }

    pub fn key_password<S: Into<String>>(mut self, pw: Option<S>) -> Self {
        self.cfg.key_password = pw.map(Into::into);
        self
    }

    pub fn chunk_size(mut self, chunk_size: Option<u64>) -> Self {
        self.cfg.chunk_size = chunk_size;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.cfg
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_secrets() {
        let cfg = ConfigBuilder::from_default()
            .repository("/srv/backup")
            .password("hunter2")
            .key_file(Some("/etc/pbs/key"))
            .key_password(Some("s3cret"))
            .build();
        let s = cfg.to_string();
        assert!(s.contains("/srv/backup"));
        assert!(s.contains("/etc/pbs/key"));
        assert!(!s.contains("hunter2"));
        assert!(!s.contains("s3cret"));
    }

    #[test]
    fn params_require_repository() {
        let cfg = SessionConfig::default();
        let err = cfg.backup_params("vm100", 1).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn params_carry_key_material() {
        let cfg = SessionConfig::default()
            .with_repository("store1")
            .with_password("pw")
            .with_key_file(Some("/k"))
            .with_key_password(Some("kp"))
            .with_chunk_size(Some(1 << 20));
        let p = cfg.backup_params("vm100", 1_700_000_000).unwrap();
        assert_eq!(p.repo, "store1");
        assert_eq!(p.chunk_size, Some(1 << 20));
        let key = p.key.as_ref().unwrap();
        assert_eq!(key.key_file, "/k");
        assert_eq!(key.key_password.as_deref(), Some("kp"));

        let r = cfg.restore_params("vm", "100", 1_700_000_000).unwrap();
        assert_eq!(r.snapshot_type, "vm");
        assert!(r.key.is_some());
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"repository":"/srv/backup","key_password":"kp"}"#).unwrap();
        let cfg = SessionConfig::load(&path).unwrap();
        assert_eq!(cfg.repository, "/srv/backup");
        assert!(cfg.password.is_empty());
        assert_eq!(cfg.key_password.as_deref(), Some("kp"));
        assert!(cfg.key_file.is_none());
        assert!(cfg.chunk_size.is_none());
        assert!(!cfg.to_string().contains("kp"));
    }
}
