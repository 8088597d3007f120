//! Snapshot naming used by the bundled engines: `<type>/<id>/<RFC 3339 UTC time>`,
//! e.g. `vm/100/2023-11-14T22:13:20Z`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;

/// Backup types a snapshot may belong to.
pub const SNAPSHOT_TYPES: &[&str] = &["vm", "ct", "host"];

/// Backup type used for backup sessions (images of virtual machines).
pub const BACKUP_SESSION_TYPE: &str = "vm";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotName {
    pub snapshot_type: String,
    pub backup_id: String,
    pub backup_time: i64,
}

impl SnapshotName {
    pub fn new(snapshot_type: &str, backup_id: &str, backup_time: i64) -> Result<Self> {
        if !SNAPSHOT_TYPES.contains(&snapshot_type) {
            return Err(anyhow!(
                "unknown backup type '{}' (expected one of {})",
                snapshot_type,
                SNAPSHOT_TYPES.join(", ")
            ));
        }
        validate_backup_id(backup_id)?;
        if backup_time < 0 {
            return Err(anyhow!("backup time {} is before the epoch", backup_time));
        }
        // проверка диапазона делается здесь, чтобы Display не мог упасть
        format_time(backup_time)?;
        Ok(Self {
            snapshot_type: snapshot_type.to_string(),
            backup_id: backup_id.to_string(),
            backup_time,
        })
    }

    /// Parse `<type>/<id>/<time>`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        let (t, id, time) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(id), Some(time)) => (t, id, time),
            _ => return Err(anyhow!("malformed snapshot name '{}'", s)),
        };
        let ts = DateTime::parse_from_rfc3339(time)
            .with_context(|| format!("parse snapshot time '{}'", time))?
            .timestamp();
        Self::new(t, id, ts)
    }

    /// Relative directory of the snapshot inside a repository.
    pub fn rel_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.snapshot_type)
            .join(&self.backup_id)
            .join(self.time_string())
    }

    pub fn time_string(&self) -> String {
        format_time(self.backup_time).unwrap_or_else(|_| self.backup_time.to_string())
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.snapshot_type, self.backup_id, self.time_string())
    }
}

/// Canonical snapshot string for (type, id, time).
pub fn canonical_name(snapshot_type: &str, backup_id: &str, backup_time: i64) -> Result<String> {
    Ok(SnapshotName::new(snapshot_type, backup_id, backup_time)?.to_string())
}

fn format_time(secs: i64) -> Result<String> {
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| anyhow!("backup time {} out of range", secs))?;
    Ok(dt.format(TIME_FORMAT).to_string())
}

fn validate_backup_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("backup id must not be empty"));
    }
    let ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok || id.starts_with('.') {
        return Err(anyhow!("invalid backup id '{}'", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_format() {
        let s = canonical_name("vm", "100", 1_700_000_000).unwrap();
        assert_eq!(s, "vm/100/2023-11-14T22:13:20Z");
        let back = SnapshotName::parse(&s).unwrap();
        assert_eq!(back.backup_time, 1_700_000_000);
        assert_eq!(back.backup_id, "100");
    }

    #[test]
    fn rejects_bad_components() {
        assert!(canonical_name("lxc", "100", 0).is_err());
        assert!(canonical_name("vm", "", 0).is_err());
        assert!(canonical_name("vm", "a/b", 0).is_err());
        assert!(canonical_name("vm", "100", -5).is_err());
        assert!(SnapshotName::parse("vm/100").is_err());
    }
}
