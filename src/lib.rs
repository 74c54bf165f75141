//! # kvsnap
//!
//! Snapshot tooling for the control-plane key-value store:
//! - Initialization check against the managed store
//! - Cluster bootstrap from the store (or the newest local snapshot)
//! - Consistent snapshots, kept locally and optionally uploaded to S3
//! - Deletion of named snapshots from every location
//! - Cancellation on SIGINT/SIGTERM at every blocking step
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   resolve (node name, data dir)
//!             │
//!   ┌─────────▼──────────┐
//!   │   ControlConfig    │
//!   └─────────┬──────────┘
//!             │
//!   ┌─────────▼──────────┐   save only   ┌──────────────────┐
//!   │    StoreClient     │──────────────▶│ ClusterCoordinator│
//!   │ (init, snapshot,   │               │  (bootstrap)      │
//!   │  delete)           │◀──────────────└──────────────────┘
//!   └───┬────────────┬───┘
//!       │            │
//!  ┌────▼─────┐ ┌────▼──────┐
//!  │ local fs │ │ S3 bucket │
//!  └──────────┘ └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Save a snapshot
//! kvsnap save --data-dir /var/lib/kvsnap --name nightly
//!
//! # Save and upload
//! kvsnap save --s3 --s3-bucket backups --s3-folder node-a
//!
//! # Delete snapshots
//! kvsnap delete etcd-snapshot-node-a-1700000000
//!
//! # List snapshots
//! kvsnap ls
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;
pub mod s3;
pub mod store;

// Re-export commonly used types
pub use common::{ControlConfig, Error, ErrorKind, Result};
pub use ops::SnapshotRequest;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
