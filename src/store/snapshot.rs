//! Snapshot file format
//!
//! `[MAGIC:8][BODY_LEN:8][BODY (bincode)][CRC32(BODY):4]`

use crate::common::signals;
use crate::common::utils::with_suffix;
use crate::common::{blake3_hash, crc32, Error, Result};
use crate::store::engine::StoreState;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const SNAPSHOT_MAGIC: [u8; 8] = *b"KVSNAP01";

/// Everything persisted in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBody {
    pub node_name: String,
    pub created_at: u64,
    pub state: StoreState,
}

/// What was written to disk
#[derive(Debug, Clone)]
pub struct WrittenSnapshot {
    pub path: PathBuf,
    pub size: u64,
    pub digest: String,
    pub bytes: Vec<u8>,
}

pub fn encode(body: &SnapshotBody) -> Result<Vec<u8>> {
    let payload = bincode::serialize(body)
        .map_err(|e| Error::Operation(format!("snapshot encode failed: {}", e)))?;

    let mut out = Vec::with_capacity(SNAPSHOT_MAGIC.len() + 12 + payload.len());
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32(&payload).to_le_bytes());
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<SnapshotBody> {
    let header = SNAPSHOT_MAGIC.len() + 8;
    if bytes.len() < header + 4 || bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(Error::Corrupted("not a snapshot file".into()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[SNAPSHOT_MAGIC.len()..header]);
    let len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| Error::Corrupted("snapshot length out of range".into()))?;
    if header.checked_add(len).and_then(|n| n.checked_add(4)) != Some(bytes.len()) {
        return Err(Error::Corrupted("snapshot length mismatch".into()));
    }

    let payload = &bytes[header..header + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[header + len..]);
    if crc32(payload) != u32::from_le_bytes(crc_bytes) {
        return Err(Error::Corrupted("snapshot checksum mismatch".into()));
    }

    bincode::deserialize(payload).map_err(|e| Error::Corrupted(e.to_string()))
}

/// Write a snapshot atomically: the file only appears under its final
/// name once fully synced, and never if `cancel` fires first. An existing
/// file at `path` is never replaced.
pub fn write(path: &Path, body: &SnapshotBody, cancel: &CancellationToken) -> Result<WrittenSnapshot> {
    let bytes = encode(body)?;
    let tmp = with_suffix(path, "part");

    let staged = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        signals::check(cancel)?;
        fs::hard_link(&tmp, path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                Error::Operation(format!("snapshot {} already exists", path.display()))
            }
            _ => e.into(),
        })?;
        Ok(())
    })();

    let _ = fs::remove_file(&tmp);
    staged?;

    Ok(WrittenSnapshot {
        path: path.to_path_buf(),
        size: bytes.len() as u64,
        digest: blake3_hash(&bytes),
        bytes,
    })
}

pub fn read(path: &Path) -> Result<SnapshotBody> {
    decode(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn body() -> SnapshotBody {
        let mut state = StoreState::default();
        state.revision = 7;
        state.entries.insert("/registry/pods/a".into(), b"pod-a".to_vec());
        SnapshotBody {
            node_name: "node-a".into(),
            created_at: 1_700_000_000,
            state,
        }
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etcd-snapshot-node-a-1700000000");
        let token = CancellationToken::new();

        let written = write(&path, &body(), &token).unwrap();
        assert_eq!(written.size, fs::metadata(&path).unwrap().len());
        assert_eq!(written.digest, blake3_hash(&fs::read(&path).unwrap()));
        assert_eq!(read(&path).unwrap(), body());
    }

    #[test]
    fn test_detects_corruption() {
        let mut bytes = encode(&body()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(Error::Corrupted(_))));

        assert!(decode(b"garbage").is_err());
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut bytes = SNAPSHOT_MAGIC.to_vec();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode(&bytes), Err(Error::Corrupted(_))));

        let mut bytes = encode(&body()).unwrap();
        bytes[8..16].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
        assert!(matches!(decode(&bytes), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_write_never_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etcd-snapshot-node-a-1700000000");
        let token = CancellationToken::new();
        write(&path, &body(), &token).unwrap();

        let mut other = body();
        other.node_name = "node-b".into();
        let err = write(&path, &other, &token).unwrap_err();

        assert!(matches!(err, Error::Operation(ref m) if m.contains("already exists")));
        assert_eq!(read(&path).unwrap().node_name, "node-a");
        assert!(!with_suffix(&path, "part").exists());
    }

    #[test]
    fn test_cancelled_write_leaves_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap");
        let token = CancellationToken::new();
        token.cancel();

        let err = write(&path, &body(), &token).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!path.exists());
        assert!(!with_suffix(&path, "part").exists());
    }
}
