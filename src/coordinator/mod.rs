//! Cluster coordination
//!
//! The coordinator is responsible for:
//! - Reading the cluster record (members, shared files) from the store
//! - Falling back to the newest local snapshot when the store has none
//! - Reconciling shared TLS/credential files onto local disk
//! - Loading the administrative credential context

pub mod admin;
pub mod bootstrap;
pub mod membership;

pub use admin::{AdminAuth, AdminContext};
pub use bootstrap::{ClusterCoordinator, ClusterView, RecordSource, StoreCoordinator};
pub use membership::{ClusterRecord, Member, CLUSTER_RECORD_KEY};
