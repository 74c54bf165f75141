//! Common utilities and types shared across kvsnap

pub mod config;
pub mod error;
pub mod resolve;
pub mod signals;
pub mod utils;

pub use config::{
    ControlConfig, ControlConfigBuilder, DataDir, FileConfig, RuntimePaths, S3Config, S3Options,
};
pub use error::{Error, ErrorKind, Result};
pub use signals::{cancellable, shutdown_token};
pub use utils::{blake3_hash, crc32, format_bytes, timestamp_now, validate_snapshot_name};
