//! Utility functions for kvsnap

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Validate a snapshot name given for deletion: it has to name a single
/// file, never a path.
pub fn validate_snapshot_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::Operation("snapshot name cannot be empty".into()));
    }

    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(crate::Error::Operation(format!(
            "invalid snapshot name {:?}: must not be a path",
            name
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(crate::Error::Operation(format!(
            "invalid snapshot name {:?}: contains control characters",
            name
        )));
    }

    Ok(())
}

/// Sibling path with an extra suffix (`a/b.crt` -> `a/b.crt.<suffix>`)
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Write `data` to `path` through a temp file and rename, syncing the
/// file before it becomes visible.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = with_suffix(path, "part");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
