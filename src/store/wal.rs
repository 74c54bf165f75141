//! Write-ahead log backing the managed store
//!
//! Frame format: [MAGIC:4][SEQUENCE:8][OP:1][KEY_LEN:4][VALUE_LEN:4][KEY][VALUE][CRC32:4]
//!
//! The CRC covers everything between the magic and the checksum. Replay
//! stops at the first frame that is short or fails its checksum, so a
//! torn tail from an interrupted append is never surfaced.

use crate::common::{crc32, Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: [u8; 4] = *b"KVW1";
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Name of the log file inside the WAL directory
pub const WAL_FILE: &str = "wal.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub sequence: u64,
    pub op: WalOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WalOp {
    fn code(&self) -> u8 {
        match self {
            WalOp::Put { .. } => OP_PUT,
            WalOp::Delete { .. } => OP_DELETE,
        }
    }

    fn key(&self) -> &str {
        match self {
            WalOp::Put { key, .. } | WalOp::Delete { key } => key,
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            WalOp::Put { value, .. } => value,
            WalOp::Delete { .. } => &[],
        }
    }
}

/// When appends reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every append
    Always,
    /// Flush to the OS only
    Never,
}

/// Append handle on the log
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: SyncPolicy,
}

impl Wal {
    /// Open or create the log, continuing after the last intact frame.
    pub fn open(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_sequence = 0;
        let mut valid_len = 0u64;
        Self::scan(&path, |entry, end| {
            next_sequence = entry.sequence + 1;
            valid_len = end;
            Ok(())
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        // Drop a torn tail so new frames are not appended after garbage
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Truncating torn WAL tail in {} at byte {}",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        let mut file = file;
        std::io::Seek::seek(&mut file, std::io::SeekFrom::End(0))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence,
            sync_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append an operation, returning its sequence number
    pub fn append(&mut self, op: &WalOp) -> Result<u64> {
        let sequence = self.next_sequence;
        let frame = encode_frame(sequence, op);
        self.writer.write_all(&frame)?;
        self.next_sequence += 1;

        match self.sync_policy {
            SyncPolicy::Always => self.sync()?,
            SyncPolicy::Never => self.writer.flush()?,
        }

        Ok(sequence)
    }

    pub fn append_put(&mut self, key: &str, value: &[u8]) -> Result<u64> {
        self.append(&WalOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    pub fn append_delete(&mut self, key: &str) -> Result<u64> {
        self.append(&WalOp::Delete {
            key: key.to_string(),
        })
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay every intact entry in order. A missing log replays nothing.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(WalEntry) -> Result<()>,
    {
        Self::scan(path.as_ref(), |entry, _| callback(entry))
    }

    fn scan<F>(path: &Path, callback: F) -> Result<()>
    where
        F: FnMut(WalEntry, u64) -> Result<()>,
    {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();

        scan_frames(BufReader::new(file), len, callback).map_err(|e| {
            tracing::error!("WAL replay of {} failed: {}", path.display(), e);
            e
        })
    }
}

/// Feed every intact frame to `callback`. A short or corrupt frame ends
/// the log; any other read error is returned.
fn scan_frames<R, F>(mut reader: R, len: u64, mut callback: F) -> Result<()>
where
    R: Read,
    F: FnMut(WalEntry, u64) -> Result<()>,
{
    let mut offset = 0u64;

    loop {
        match read_frame(&mut reader, len - offset) {
            Ok(Some((entry, frame_len))) => {
                offset += frame_len;
                callback(entry, offset)?;
            }
            Ok(None) => return Ok(()),
            Err(e @ Error::Corrupted(_)) => {
                tracing::warn!("WAL replay stopped at byte {}: {}", offset, e);
                return Ok(());
            }
            Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!("WAL replay stopped at byte {}: torn frame", offset);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn encode_frame(sequence: u64, op: &WalOp) -> Vec<u8> {
    let key = op.key().as_bytes();
    let value = op.value();

    let mut frame = Vec::with_capacity(25 + key.len() + value.len());
    frame.extend_from_slice(&WAL_MAGIC);
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.push(op.code());
    frame.extend_from_slice(&(key.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(value.len() as u32).to_le_bytes());
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);

    let checksum = crc32(&frame[WAL_MAGIC.len()..]);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

/// Read one frame out of the `remaining` bytes of the log. `Ok(None)`
/// means a clean end of log.
fn read_frame<R: Read>(reader: &mut R, remaining: u64) -> Result<Option<(WalEntry, u64)>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic != WAL_MAGIC {
        return Err(Error::Corrupted("invalid WAL magic".into()));
    }

    let mut header = [0u8; 17];
    reader.read_exact(&mut header)?;
    let sequence = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
    let op = header[8];
    let key_len = u32::from_le_bytes(header[9..13].try_into().unwrap_or_default()) as usize;
    let val_len = u32::from_le_bytes(header[13..17].try_into().unwrap_or_default()) as usize;

    let frame_len = (4 + header.len() + 4) as u64 + key_len as u64 + val_len as u64;
    if frame_len > remaining {
        return Err(Error::Corrupted(format!(
            "WAL frame at sequence {} runs past the end of the log",
            sequence
        )));
    }

    let mut payload = vec![0u8; key_len + val_len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(checksum_bytes) {
        return Err(Error::Corrupted(format!(
            "WAL checksum mismatch at sequence {}",
            sequence
        )));
    }

    let value = payload.split_off(key_len);
    let key = String::from_utf8(payload)
        .map_err(|_| Error::Corrupted("invalid UTF-8 in WAL key".into()))?;

    let op = match op {
        OP_PUT => WalOp::Put { key, value },
        OP_DELETE => WalOp::Delete { key },
        other => {
            return Err(Error::Corrupted(format!("unknown WAL op code: {}", other)));
        }
    };

    Ok(Some((WalEntry { sequence, op }, frame_len)))
}
