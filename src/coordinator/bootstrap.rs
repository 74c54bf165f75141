//! Cluster bootstrap
//!
//! Derives the node's view of the cluster from the managed store and
//! reconciles the shared TLS/credential files onto local disk.
//!
//! Reconciliation is all-or-nothing: every changed file is staged next to
//! its target first, existing targets are moved aside, and on any failure
//! the previous files are put back.

use crate::common::signals::{self, run_blocking};
use crate::common::utils::with_suffix;
use crate::common::{ControlConfig, Error, Result};
use crate::coordinator::membership::{ClusterRecord, Member, CLUSTER_RECORD_KEY};
use crate::store::engine::read_state;
use crate::store::index::{SnapshotIndex, SnapshotLocation};
use crate::store::snapshot;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const STAGED_SUFFIX: &str = "kvsnap-tmp";
const BACKUP_SUFFIX: &str = "kvsnap-bak";

/// Cluster id reported when no record exists anywhere
pub const STANDALONE_CLUSTER_ID: &str = "standalone";

/// Where the cluster record came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    Store,
    /// Name of the snapshot the record was read from
    Snapshot(String),
    Standalone,
}

/// The node's view of the cluster after bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub cluster_id: String,
    pub node_name: String,
    pub members: Vec<Member>,
    pub source: RecordSource,
    /// Every file the record manages, relative to the data directory
    pub files: Vec<String>,
    /// Files rewritten by this bootstrap
    pub changed: Vec<String>,
}

impl ClusterView {
    fn standalone(node_name: &str) -> Self {
        Self {
            cluster_id: STANDALONE_CLUSTER_ID.to_string(),
            node_name: node_name.to_string(),
            members: vec![Member {
                name: node_name.to_string(),
                peer_url: String::new(),
            }],
            source: RecordSource::Standalone,
            files: Vec::new(),
            changed: Vec::new(),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait ClusterCoordinator {
    /// Establish cluster state before any consistency-sensitive work.
    /// Calling it again on an unchanged store changes nothing on disk.
    async fn bootstrap(&self, cancel: &CancellationToken) -> Result<ClusterView>;
}

/// Bootstraps from the managed store under the configured data directory
pub struct StoreCoordinator {
    config: Arc<ControlConfig>,
}

impl StoreCoordinator {
    pub fn new(config: Arc<ControlConfig>) -> Self {
        Self { config }
    }
}

impl ClusterCoordinator for StoreCoordinator {
    async fn bootstrap(&self, cancel: &CancellationToken) -> Result<ClusterView> {
        let config = self.config.clone();
        let view = run_blocking(cancel, move |token| reconcile(&config, token))
            .await
            .map_err(Error::into_bootstrap)?;

        tracing::info!(
            "Bootstrapped node {} into cluster {} ({} members, {} files updated)",
            view.node_name,
            view.cluster_id,
            view.members.len(),
            view.changed.len()
        );
        Ok(view)
    }
}

fn reconcile(config: &ControlConfig, cancel: &CancellationToken) -> Result<ClusterView> {
    let node_name = config.node_name();
    let Some((record, source)) = load_record(config)? else {
        tracing::info!("No cluster record found, bootstrapping {} standalone", node_name);
        return Ok(ClusterView::standalone(node_name));
    };

    let files = record.validate(node_name)?;
    signals::check(cancel)?;

    let root = config.data_dir().path();
    let plan = plan_changes(root, &files)?;
    if !plan.is_empty() {
        apply_files(root, &plan, cancel)?;
    }

    Ok(ClusterView {
        cluster_id: record.cluster_id,
        node_name: node_name.to_string(),
        members: record.members,
        source,
        files: files.into_keys().collect(),
        changed: plan.into_iter().map(|(path, _)| path).collect(),
    })
}

/// The record from the live store, else from the newest local snapshot
fn load_record(config: &ControlConfig) -> Result<Option<(ClusterRecord, RecordSource)>> {
    let state = read_state(&config.data_dir().store_dir())?;
    if let Some(raw) = state.get(CLUSTER_RECORD_KEY) {
        return Ok(Some((ClusterRecord::from_json(raw)?, RecordSource::Store)));
    }

    let index = SnapshotIndex::load(&config.data_dir().index_path())?;
    let Some(latest) = index.latest_local() else {
        return Ok(None);
    };
    let SnapshotLocation::Local { path } = &latest.location else {
        return Ok(None);
    };

    let body = match snapshot::read(path) {
        Ok(body) => body,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                "Snapshot {} is indexed but missing from {}",
                latest.name,
                path.display()
            );
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    match body.state.get(CLUSTER_RECORD_KEY) {
        Some(raw) => {
            tracing::info!("Using cluster record from snapshot {}", latest.name);
            Ok(Some((
                ClusterRecord::from_json(raw)?,
                RecordSource::Snapshot(latest.name.clone()),
            )))
        }
        None => Ok(None),
    }
}

/// Files whose on-disk contents differ from the record
fn plan_changes(root: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<(String, Vec<u8>)>> {
    let mut plan = Vec::new();
    for (rel, wanted) in files {
        match fs::read(root.join(rel)) {
            Ok(current) if &current == wanted => {}
            Ok(_) => plan.push((rel.clone(), wanted.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                plan.push((rel.clone(), wanted.clone()))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(plan)
}

/// Write every file or none of them
pub fn apply_files(
    root: &Path,
    files: &[(String, Vec<u8>)],
    cancel: &CancellationToken,
) -> Result<()> {
    let targets: Vec<PathBuf> = files.iter().map(|(rel, _)| root.join(rel)).collect();
    let staged: Vec<PathBuf> = targets
        .iter()
        .map(|t| with_suffix(t, STAGED_SUFFIX))
        .collect();

    let stage_result = files
        .iter()
        .zip(&staged)
        .try_for_each(|((_, data), tmp)| stage_file(tmp, data))
        .and_then(|()| signals::check(cancel));
    if let Err(e) = stage_result {
        remove_all(&staged);
        return Err(e);
    }

    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut committed: Vec<&PathBuf> = Vec::new();
    let commit_result = (|| -> Result<()> {
        for (target, tmp) in targets.iter().zip(&staged) {
            if target.exists() {
                let backup = with_suffix(target, BACKUP_SUFFIX);
                fs::rename(target, &backup)?;
                backups.push((backup, target.clone()));
            }
            fs::rename(tmp, target)?;
            committed.push(target);
        }
        Ok(())
    })();

    if let Err(e) = commit_result {
        tracing::warn!("Reconciling cluster files failed, rolling back: {}", e);
        for target in committed {
            let _ = fs::remove_file(target);
        }
        for (backup, target) in &backups {
            if let Err(restore_err) = fs::rename(backup, target) {
                tracing::error!("Could not restore {}: {}", target.display(), restore_err);
            }
        }
        remove_all(&staged);
        return Err(e);
    }

    for (backup, _) in &backups {
        let _ = fs::remove_file(backup);
    }
    Ok(())
}

fn stage_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::resolve::resolve_data_dir;
    use crate::coordinator::membership::ClusterFile;
    use crate::store::engine::ManagedStore;
    use crate::store::index::{SnapshotEntry, SnapshotStatus};
    use crate::store::snapshot::SnapshotBody;
    use crate::store::wal::SyncPolicy;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use chrono::Utc;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Arc<ControlConfig>) {
        let dir = tempdir().unwrap();
        let data_dir = resolve_data_dir(Some(dir.path())).unwrap();
        let config = ControlConfig::builder("node-a", data_dir).build().unwrap();
        (dir, Arc::new(config))
    }

    fn record(members: &[&str]) -> ClusterRecord {
        let mut files = BTreeMap::new();
        for (path, content) in [
            ("tls/etcd/server-ca.crt", "ca-v1"),
            ("cred/admin.kubeconfig", "kubeconfig-v1"),
        ] {
            files.insert(
                path.to_string(),
                ClusterFile {
                    content: BASE64.encode(content),
                    updated_at: 1,
                },
            );
        }
        ClusterRecord {
            cluster_id: "cluster-1".into(),
            members: members
                .iter()
                .map(|n| Member {
                    name: n.to_string(),
                    peer_url: format!("https://{}:2380", n),
                })
                .collect(),
            files,
        }
    }

    fn publish(config: &ControlConfig, raw: &[u8]) {
        let mut store =
            ManagedStore::open(config.data_dir().store_dir(), SyncPolicy::Always).unwrap();
        store.put(CLUSTER_RECORD_KEY, raw).unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_writes_files_and_is_idempotent() {
        let (_dir, config) = setup();
        publish(&config, &record(&["node-a", "node-b"]).to_json().unwrap());
        let coord = StoreCoordinator::new(config.clone());
        let token = CancellationToken::new();

        let first = coord.bootstrap(&token).await.unwrap();
        assert_eq!(first.cluster_id, "cluster-1");
        assert_eq!(first.source, RecordSource::Store);
        assert_eq!(first.changed.len(), 2);
        assert_eq!(
            fs::read(&config.runtime().admin_kubeconfig).unwrap(),
            b"kubeconfig-v1"
        );

        let second = coord.bootstrap(&token).await.unwrap();
        assert!(second.changed.is_empty());
        assert_eq!(second.members, first.members);
        assert_eq!(second.files, first.files);
    }

    #[tokio::test]
    async fn test_bootstrap_replaces_stale_file() {
        let (_dir, config) = setup();
        let ca = &config.runtime().server_ca;
        fs::create_dir_all(ca.parent().unwrap()).unwrap();
        fs::write(ca, b"old").unwrap();
        publish(&config, &record(&[]).to_json().unwrap());

        let view = StoreCoordinator::new(config.clone())
            .bootstrap(&CancellationToken::new())
            .await
            .unwrap();

        assert!(view.changed.contains(&"tls/etcd/server-ca.crt".to_string()));
        assert_eq!(fs::read(ca).unwrap(), b"ca-v1");
        assert!(!with_suffix(ca, BACKUP_SUFFIX).exists());
        assert!(!with_suffix(ca, STAGED_SUFFIX).exists());
    }

    #[tokio::test]
    async fn test_standalone_without_record() {
        let (_dir, config) = setup();
        let view = StoreCoordinator::new(config.clone())
            .bootstrap(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(view.source, RecordSource::Standalone);
        assert_eq!(view.cluster_id, STANDALONE_CLUSTER_ID);
        assert_eq!(view.members.len(), 1);
        assert!(view.files.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_leaves_disk_unchanged() {
        let (_dir, config) = setup();
        publish(&config, b"{\"cluster_id\": ");

        let err = StoreCoordinator::new(config.clone())
            .bootstrap(&CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::common::ErrorKind::Bootstrap);
        assert!(!config.data_dir().path().join("tls").exists());
        assert!(!config.data_dir().path().join("cred").exists());
    }

    #[tokio::test]
    async fn test_non_member_rejected() {
        let (_dir, config) = setup();
        publish(&config, &record(&["node-b"]).to_json().unwrap());

        let err = StoreCoordinator::new(config.clone())
            .bootstrap(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Bootstrap { .. }));
        assert!(!config.runtime().admin_kubeconfig.exists());
    }

    #[tokio::test]
    async fn test_falls_back_to_latest_snapshot() {
        let (_dir, config) = setup();
        let mut state = crate::store::engine::StoreState::default();
        state.entries.insert(
            CLUSTER_RECORD_KEY.to_string(),
            record(&["node-a"]).to_json().unwrap(),
        );
        let snap_path = config.snapshot_dir().join("etcd-snapshot-node-a-100");
        fs::create_dir_all(config.snapshot_dir()).unwrap();
        let body = SnapshotBody {
            node_name: "node-a".into(),
            created_at: 100,
            state,
        };
        snapshot::write(&snap_path, &body, &CancellationToken::new()).unwrap();

        let mut index = SnapshotIndex::default();
        index.record(SnapshotEntry {
            name: "etcd-snapshot-node-a-100".into(),
            node_name: "node-a".into(),
            location: SnapshotLocation::Local { path: snap_path },
            created_at: Utc::now(),
            size: 0,
            digest: None,
            status: SnapshotStatus::Successful,
            message: None,
        });
        index.save(&config.data_dir().index_path()).unwrap();

        let view = StoreCoordinator::new(config.clone())
            .bootstrap(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            view.source,
            RecordSource::Snapshot("etcd-snapshot-node-a-100".into())
        );
        assert_eq!(fs::read(&config.runtime().server_ca).unwrap(), b"ca-v1");
    }

    #[test]
    fn test_apply_files_cancelled_cleans_staging() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let files = vec![("tls/a.crt".to_string(), b"a".to_vec())];
        let err = apply_files(dir.path(), &files, &token).unwrap_err();

        assert!(err.is_cancelled());
        assert!(!dir.path().join("tls/a.crt").exists());
        assert!(!with_suffix(&dir.path().join("tls/a.crt"), STAGED_SUFFIX).exists());
    }

    #[test]
    fn test_apply_files_staging_failure_changes_nothing() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tls")).unwrap();
        fs::write(dir.path().join("tls/a.crt"), b"old").unwrap();
        // A regular file where a directory is needed makes staging fail
        fs::write(dir.path().join("cred"), b"").unwrap();

        let files = vec![
            ("tls/a.crt".to_string(), b"new".to_vec()),
            ("cred/admin.kubeconfig".to_string(), b"k".to_vec()),
        ];
        assert!(apply_files(dir.path(), &files, &CancellationToken::new()).is_err());

        assert_eq!(fs::read(dir.path().join("tls/a.crt")).unwrap(), b"old");
        assert!(!with_suffix(&dir.path().join("tls/a.crt"), STAGED_SUFFIX).exists());
    }
}
