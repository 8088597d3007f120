//! Connection parameters handed to the engine when a session is allocated.

use std::fmt;

use zeroize::Zeroize;

/// Encryption key material: path to a key file plus an optional key passphrase.
#[derive(Clone)]
pub struct KeyMaterial {
    pub key_file: String,
    pub key_password: Option<String>,
}

impl KeyMaterial {
    pub fn new<S: Into<String>>(key_file: S) -> Self {
        Self {
            key_file: key_file.into(),
            key_password: None,
        }
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.key_password = Some(password.into());
        self
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_file", &self.key_file)
            .field("key_password", &self.key_password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        if let Some(p) = self.key_password.as_mut() {
            p.zeroize();
        }
    }
}

/// Parameters of a backup-mode session.
#[derive(Clone)]
pub struct BackupParams {
    pub repo: String,
    pub backup_id: String,
    /// Seconds since the epoch; identifies the snapshot together with the id.
    pub backup_time: u64,
    pub password: String,
    pub fingerprint: Option<String>,
    pub key: Option<KeyMaterial>,
    /// None = engine default chunk size.
    pub chunk_size: Option<u64>,
}

impl BackupParams {
    pub fn new<R, I, P>(repo: R, backup_id: I, backup_time: u64, password: P) -> Self
    where
        R: Into<String>,
        I: Into<String>,
        P: Into<String>,
    {
        Self {
            repo: repo.into(),
            backup_id: backup_id.into(),
            backup_time,
            password: password.into(),
            fingerprint: None,
            key: None,
            chunk_size: None,
        }
    }

    pub fn with_fingerprint<S: Into<String>>(mut self, fp: Option<S>) -> Self {
        self.fingerprint = fp.map(Into::into);
        self
    }

    pub fn with_key(mut self, key: Option<KeyMaterial>) -> Self {
        self.key = key;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<u64>) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl fmt::Debug for BackupParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupParams")
            .field("repo", &self.repo)
            .field("backup_id", &self.backup_id)
            .field("backup_time", &self.backup_time)
            .field("password", &"***")
            .field("fingerprint", &self.fingerprint)
            .field("key", &self.key)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl Drop for BackupParams {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Parameters of a restore-mode session. The snapshot is given as (type, id, time) and
/// resolved to its canonical name by the engine.
#[derive(Clone)]
pub struct RestoreParams {
    pub repo: String,
    pub snapshot_type: String,
    pub backup_id: String,
    pub backup_time: u64,
    pub password: String,
    pub fingerprint: Option<String>,
    pub key: Option<KeyMaterial>,
}

impl RestoreParams {
    pub fn new<R, T, I, P>(repo: R, snapshot_type: T, backup_id: I, backup_time: u64, password: P) -> Self
    where
        R: Into<String>,
        T: Into<String>,
        I: Into<String>,
        P: Into<String>,
    {
        Self {
            repo: repo.into(),
            snapshot_type: snapshot_type.into(),
            backup_id: backup_id.into(),
            backup_time,
            password: password.into(),
            fingerprint: None,
            key: None,
        }
    }

    pub fn with_fingerprint<S: Into<String>>(mut self, fp: Option<S>) -> Self {
        self.fingerprint = fp.map(Into::into);
        self
    }

    pub fn with_key(mut self, key: Option<KeyMaterial>) -> Self {
        self.key = key;
        self
    }
}

impl fmt::Debug for RestoreParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreParams")
            .field("repo", &self.repo)
            .field("snapshot_type", &self.snapshot_type)
            .field("backup_id", &self.backup_id)
            .field("backup_time", &self.backup_time)
            .field("password", &"***")
            .field("fingerprint", &self.fingerprint)
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for RestoreParams {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_masks_secrets() {
        let p = BackupParams::new("store1", "vm100", 1, "hunter2")
            .with_key(Some(KeyMaterial::new("/etc/key.json").with_password("s3cret")));
        let s = format!("{:?}", p);
        assert!(!s.contains("hunter2"));
        assert!(!s.contains("s3cret"));
        assert!(s.contains("/etc/key.json"));
    }
}
