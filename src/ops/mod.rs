//! Snapshot commands

pub mod orchestrator;

pub use orchestrator::{
    delete, list, run_delete, run_save, save, Invocation, SnapshotRequest,
};
