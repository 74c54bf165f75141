//! Node name and data directory resolution
//!
//! The resolved node name is returned to the caller and threaded through
//! [`ControlConfig`](crate::common::ControlConfig); nothing here writes to
//! the process environment.

use crate::common::{DataDir, Error, Result};
use std::path::{Path, PathBuf};

/// Data directory root used when none is given
pub const DEFAULT_DATA_DIR: &str = "/var/lib/kvsnap";

const HOSTNAME_SOURCES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Outcome of resolution: both values are non-empty and the directory exists
#[derive(Debug, Clone)]
pub struct Resolved {
    pub node_name: String,
    pub data_dir: DataDir,
}

/// Resolve node name and data directory in one step
pub fn resolve(node_name_hint: &str, data_dir_hint: Option<&Path>) -> Result<Resolved> {
    let node_name = resolve_node_name(node_name_hint)?;
    let data_dir = resolve_data_dir(data_dir_hint)?;
    tracing::debug!(
        "Resolved node {} with data dir {}",
        node_name,
        data_dir.path().display()
    );
    Ok(Resolved {
        node_name,
        data_dir,
    })
}

/// Non-empty hints pass through unchanged; empty ones fall back to the
/// system hostname.
pub fn resolve_node_name(hint: &str) -> Result<String> {
    resolve_node_name_with(hint, system_hostname)
}

pub fn resolve_node_name_with<F>(hint: &str, lookup: F) -> Result<String>
where
    F: FnOnce() -> std::io::Result<String>,
{
    if !hint.is_empty() {
        return Ok(hint.to_string());
    }
    lookup().map_err(|source| Error::Resolution {
        what: "hostname",
        source,
    })
}

/// Read the kernel hostname
pub fn system_hostname() -> std::io::Result<String> {
    let mut last_err = None;
    for source in HOSTNAME_SOURCES {
        match std::fs::read_to_string(source) {
            Ok(raw) => {
                let name = raw.trim();
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "hostname is empty")
    }))
}

/// Resolve the data directory to an absolute `<root>/server` path and
/// make sure it exists.
pub fn resolve_data_dir(hint: Option<&Path>) -> Result<DataDir> {
    let root = match hint {
        Some(p) if !p.as_os_str().is_empty() => expand_home(p),
        _ => PathBuf::from(DEFAULT_DATA_DIR),
    };

    let root = if root.is_absolute() {
        root
    } else {
        let cwd = std::env::current_dir().map_err(|source| Error::Resolution {
            what: "working directory",
            source,
        })?;
        cwd.join(root)
    };

    let dir = root.join("server");
    create_private_dir(&dir).map_err(|source| Error::Resolution {
        what: "data directory",
        source,
    })?;

    Ok(DataDir::new(dir))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
