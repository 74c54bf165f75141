//! Snapshot index
//!
//! JSON manifest of every snapshot this node has taken or uploaded,
//! including failed attempts. Entries are keyed `local-<name>` and
//! `s3-<name>` so the two copies of one snapshot are tracked separately.

use crate::common::utils::write_atomic;
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SnapshotLocation {
    Local {
        path: PathBuf,
    },
    S3 {
        endpoint: String,
        bucket: String,
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Successful,
    Failed,
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotStatus::Successful => write!(f, "successful"),
            SnapshotStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub node_name: String,
    pub location: SnapshotLocation,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub status: SnapshotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SnapshotEntry {
    pub fn index_key(&self) -> String {
        match self.location {
            SnapshotLocation::Local { .. } => format!("local-{}", self.name),
            SnapshotLocation::S3 { .. } => format!("s3-{}", self.name),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.location, SnapshotLocation::Local { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIndex {
    #[serde(default)]
    entries: BTreeMap<String, SnapshotEntry>,
}

impl SnapshotIndex {
    /// Load the index; a missing file is an empty index
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Corrupted(format!("snapshot index {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Operation(format!("snapshot index encode failed: {}", e)))?;
        write_atomic(path, &json)?;
        Ok(())
    }

    pub fn record(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.index_key(), entry);
    }

    /// Drop every copy of `name`, returning how many entries went away
    pub fn remove_name(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.name != name);
        before - self.entries.len()
    }

    /// Drop only the local copy of `name`
    pub fn remove_local(&mut self, name: &str) -> bool {
        self.entries.remove(&format!("local-{}", name)).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent successful snapshot on local disk
    pub fn latest_local(&self) -> Option<&SnapshotEntry> {
        self.entries
            .values()
            .filter(|e| e.is_local() && e.status == SnapshotStatus::Successful)
            .max_by_key(|e| e.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn local(name: &str, ts: i64, status: SnapshotStatus) -> SnapshotEntry {
        SnapshotEntry {
            name: name.into(),
            node_name: "node-a".into(),
            location: SnapshotLocation::Local {
                path: PathBuf::from("/snapshots").join(name),
            },
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
            size: 10,
            digest: None,
            status,
            message: None,
        }
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let index = SnapshotIndex::load(&dir.path().join("index.json")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut index = SnapshotIndex::default();
        index.record(local("snap-1", 100, SnapshotStatus::Successful));
        index.record(SnapshotEntry {
            location: SnapshotLocation::S3 {
                endpoint: "s3.amazonaws.com".into(),
                bucket: "b".into(),
                key: "snap-1".into(),
            },
            ..local("snap-1", 100, SnapshotStatus::Successful)
        });
        index.save(&path).unwrap();

        let loaded = SnapshotIndex::load(&path).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_remove_name_drops_both_copies() {
        let mut index = SnapshotIndex::default();
        index.record(local("snap-1", 100, SnapshotStatus::Successful));
        index.record(SnapshotEntry {
            location: SnapshotLocation::S3 {
                endpoint: "e".into(),
                bucket: "b".into(),
                key: "snap-1".into(),
            },
            ..local("snap-1", 100, SnapshotStatus::Successful)
        });
        index.record(local("snap-2", 200, SnapshotStatus::Successful));

        assert_eq!(index.remove_name("snap-1"), 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_local_keeps_remote_copy() {
        let mut index = SnapshotIndex::default();
        index.record(local("snap-1", 100, SnapshotStatus::Successful));
        index.record(SnapshotEntry {
            location: SnapshotLocation::S3 {
                endpoint: "e".into(),
                bucket: "b".into(),
                key: "snap-1".into(),
            },
            ..local("snap-1", 100, SnapshotStatus::Successful)
        });

        assert!(index.remove_local("snap-1"));
        assert!(!index.remove_local("snap-1"));
        assert_eq!(index.len(), 1);
        assert!(index.latest_local().is_none());
    }

    #[test]
    fn test_latest_local_skips_failed() {
        let mut index = SnapshotIndex::default();
        index.record(local("old", 100, SnapshotStatus::Successful));
        index.record(local("new-failed", 300, SnapshotStatus::Failed));
        index.record(local("mid", 200, SnapshotStatus::Successful));

        assert_eq!(index.latest_local().unwrap().name, "mid");
    }

    #[test]
    fn test_corrupt_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            SnapshotIndex::load(&path),
            Err(Error::Corrupted(_))
        ));
    }
}
