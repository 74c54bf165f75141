//! Managed store: on-disk state, snapshot files, and the administrative client

pub mod client;
pub mod engine;
pub mod index;
pub mod snapshot;
pub mod wal;

pub use client::{DeleteReport, LocalStoreClient, SnapshotReport, StoreClient};
pub use engine::{ManagedStore, StoreState};
pub use index::{SnapshotEntry, SnapshotIndex, SnapshotLocation, SnapshotStatus};
pub use wal::SyncPolicy;
