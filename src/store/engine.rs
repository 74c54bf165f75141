//! Managed store state on disk
//!
//! Layout under the store directory:
//! - `member/wal/wal.log`: the write-ahead log
//!
//! The presence of `member/wal` is what marks a store as initialized.

use crate::common::Result;
use crate::store::wal::{SyncPolicy, Wal, WalEntry, WalOp, WAL_FILE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory whose existence marks an initialized store
pub fn wal_dir(store_dir: &Path) -> PathBuf {
    store_dir.join("member").join("wal")
}

/// Point-in-time contents of the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    /// Number of log entries applied (last sequence + 1)
    pub revision: u64,
    pub entries: BTreeMap<String, Vec<u8>>,
}

impl StoreState {
    fn apply(&mut self, entry: WalEntry) {
        self.revision = entry.sequence + 1;
        match entry.op {
            WalOp::Put { key, value } => {
                self.entries.insert(key, value);
            }
            WalOp::Delete { key } => {
                self.entries.remove(&key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-only consistent cut: everything up to the last intact log frame.
/// Never creates or modifies files.
pub fn read_state(store_dir: &Path) -> Result<StoreState> {
    let mut state = StoreState::default();
    Wal::replay(wal_dir(store_dir).join(WAL_FILE), |entry| {
        state.apply(entry);
        Ok(())
    })?;
    Ok(state)
}

/// Writable handle on the managed store
pub struct ManagedStore {
    dir: PathBuf,
    wal: Wal,
    state: StoreState,
}

impl ManagedStore {
    /// Open or create the store, replaying the log into memory
    pub fn open(store_dir: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let dir = store_dir.as_ref().to_path_buf();
        let state = read_state(&dir)?;
        let wal = Wal::open(wal_dir(&dir).join(WAL_FILE), sync_policy)?;

        tracing::info!(
            "Managed store opened at {}: {} keys, revision {}",
            dir.display(),
            state.len(),
            state.revision
        );

        Ok(Self { dir, wal, state })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.state.get(key)
    }

    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<u64> {
        let sequence = self.wal.append_put(key, value)?;
        self.state.apply(WalEntry {
            sequence,
            op: WalOp::Put {
                key: key.to_string(),
                value: value.to_vec(),
            },
        });
        Ok(sequence)
    }

    /// Delete a key; returns `None` when the key was absent
    pub fn delete(&mut self, key: &str) -> Result<Option<u64>> {
        if self.state.get(key).is_none() {
            return Ok(None);
        }
        let sequence = self.wal.append_delete(key)?;
        self.state.apply(WalEntry {
            sequence,
            op: WalOp::Delete {
                key: key.to_string(),
            },
        });
        Ok(Some(sequence))
    }
}
