//! Store administrative operations: initialization check, snapshot, delete

use crate::common::signals::{self, cancellable, run_blocking};
use crate::common::{
    timestamp_now, validate_snapshot_name, ControlConfig, Error, Result, RuntimePaths,
};
use crate::s3::S3Client;
use crate::store::engine::{self, wal_dir};
use crate::store::index::{SnapshotEntry, SnapshotIndex, SnapshotLocation, SnapshotStatus};
use crate::store::snapshot::{self, SnapshotBody};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a successful snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReport {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub digest: String,
    pub revision: u64,
    pub keys: usize,
    /// Object key when the snapshot was also uploaded
    pub s3_key: Option<String>,
}

/// Outcome of a delete
#[derive(Debug, Clone, Default)]
pub struct DeleteReport {
    pub removed: Vec<String>,
    pub local_files: usize,
    pub remote_objects: usize,
}

/// Administrative operations against the store. Every call observes the
/// cancellation token and returns [`Error::Cancelled`] once it fires.
#[allow(async_fn_in_trait)]
pub trait StoreClient {
    /// Whether the store already has persisted state. A fresh location is
    /// `Ok(false)`, never an error.
    async fn is_initialized(&self, cancel: &CancellationToken, config: &ControlConfig)
        -> Result<bool>;

    async fn snapshot(
        &self,
        cancel: &CancellationToken,
        config: &ControlConfig,
    ) -> Result<SnapshotReport>;

    /// Delete the named snapshots wherever they exist. If any name is found
    /// nowhere, nothing is deleted.
    async fn delete_snapshots(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<DeleteReport>;
}

/// Store client for the managed store under the configured data directory
pub struct LocalStoreClient {
    config: Arc<ControlConfig>,
}

impl LocalStoreClient {
    pub fn new(config: Arc<ControlConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// All snapshot records known to this node
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotEntry>> {
        let index = SnapshotIndex::load(&self.config.data_dir().index_path())?;
        let mut entries: Vec<_> = index.entries().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
        Ok(entries)
    }

    async fn connect_s3(&self, cancel: &CancellationToken) -> Result<Option<S3Client>> {
        match self.config.s3() {
            Some(s3) => Ok(Some(S3Client::connect(s3, cancel.clone()).await?)),
            None => Ok(None),
        }
    }

    async fn update_index<F>(&self, cancel: &CancellationToken, update: F) -> Result<()>
    where
        F: FnOnce(&mut SnapshotIndex) + Send + 'static,
    {
        let path = self.config.data_dir().index_path();
        run_blocking(cancel, move |_| {
            let mut index = SnapshotIndex::load(&path)?;
            update(&mut index);
            index.save(&path)
        })
        .await
    }
}

impl StoreClient for LocalStoreClient {
    async fn is_initialized(
        &self,
        cancel: &CancellationToken,
        config: &ControlConfig,
    ) -> Result<bool> {
        let dir = wal_dir(&config.data_dir().store_dir());
        cancellable(cancel, async move {
            match tokio::fs::metadata(&dir).await {
                Ok(meta) => Ok(meta.is_dir()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn snapshot(
        &self,
        cancel: &CancellationToken,
        config: &ControlConfig,
    ) -> Result<SnapshotReport> {
        signals::check(cancel)?;
        load_client_tls(cancel, config.runtime()).await?;

        // Fail before writing anything if the remote side is unusable
        let s3 = self.connect_s3(cancel).await?;

        let snapshot_dir = config.snapshot_dir().to_path_buf();
        cancellable(cancel, async {
            tokio::fs::create_dir_all(&snapshot_dir).await?;
            Ok(())
        })
        .await?;

        let created_at = timestamp_now();
        let name = format!(
            "{}-{}-{}",
            config.snapshot_name(),
            config.node_name(),
            created_at
        );
        let path = snapshot_dir.join(&name);
        let taken = cancellable(cancel, async {
            Ok(tokio::fs::try_exists(&path).await?)
        })
        .await?;
        if taken {
            return Err(Error::Operation(format!(
                "snapshot {} already exists in {}",
                name,
                snapshot_dir.display()
            )));
        }
        let created = Utc
            .timestamp_opt(created_at as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);

        tracing::info!("Saving snapshot {} to {}", name, snapshot_dir.display());

        let store_dir = config.data_dir().store_dir();
        let node_name = config.node_name().to_string();
        let target = path.clone();
        let written = run_blocking(cancel, move |token| {
            let state = engine::read_state(&store_dir)?;
            signals::check(token)?;
            let body = SnapshotBody {
                node_name,
                created_at,
                state,
            };
            let revision = body.state.revision;
            let keys = body.state.len();
            snapshot::write(&target, &body, token).map(|w| (w, revision, keys))
        })
        .await;

        let local_entry = |size: u64,
                           digest: Option<String>,
                           status: SnapshotStatus,
                           message: Option<String>| SnapshotEntry {
            name: name.clone(),
            node_name: config.node_name().to_string(),
            location: SnapshotLocation::Local { path: path.clone() },
            created_at: created,
            size,
            digest,
            status,
            message,
        };

        let (written, revision, keys) = match written {
            Ok(w) => w,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::error!("Snapshot {} failed: {}", name, e);
                let failed = local_entry(0, None, SnapshotStatus::Failed, Some(e.to_string()));
                if let Err(index_err) = self.update_index(cancel, move |i| i.record(failed)).await {
                    tracing::warn!("Could not record failed snapshot: {}", index_err);
                }
                return Err(e);
            }
        };

        let saved = local_entry(
            written.size,
            Some(written.digest.clone()),
            SnapshotStatus::Successful,
            None,
        );
        let mut report = SnapshotReport {
            name: name.clone(),
            path: written.path.clone(),
            size: written.size,
            digest: written.digest.clone(),
            revision,
            keys,
            s3_key: None,
        };

        let mut remote_entry = None;
        let mut upload_err = None;
        if let (Some(client), Some(s3)) = (s3.as_ref(), config.s3()) {
            let key = s3.object_key(&name);
            let created_str = created_at.to_string();
            let metadata = [
                ("node-name", config.node_name()),
                ("blake3", written.digest.as_str()),
                ("created-at", created_str.as_str()),
            ];
            let location = SnapshotLocation::S3 {
                endpoint: s3.endpoint.clone(),
                bucket: s3.bucket.clone(),
                key: key.clone(),
            };
            let result = client
                .put_object(&key, Bytes::from(written.bytes), &metadata)
                .await;
            match result {
                Ok(()) => {
                    tracing::info!("Uploaded snapshot {} to s3://{}/{}", name, s3.bucket, key);
                    remote_entry = Some(SnapshotEntry {
                        location,
                        ..saved.clone()
                    });
                    report.s3_key = Some(key);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!("Upload of snapshot {} failed: {}", name, e);
                    remote_entry = Some(SnapshotEntry {
                        location,
                        status: SnapshotStatus::Failed,
                        message: Some(e.to_string()),
                        ..saved.clone()
                    });
                    upload_err = Some(e);
                }
            }
        }

        self.update_index(cancel, move |index| {
            index.record(saved);
            if let Some(entry) = remote_entry {
                index.record(entry);
            }
        })
        .await?;

        if config.retention() > 0 {
            tracing::info!(
                "Retention of {} snapshots is enforced outside this invocation",
                config.retention()
            );
        }

        if let Some(e) = upload_err {
            return Err(Error::Operation(format!(
                "snapshot {} was saved locally but the upload failed: {}",
                name, e
            )));
        }

        tracing::info!(
            "Snapshot {} saved: {} keys at revision {}",
            name,
            report.keys,
            report.revision
        );
        Ok(report)
    }

    async fn delete_snapshots(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<DeleteReport> {
        for name in names {
            validate_snapshot_name(name)?;
        }

        let s3 = self.connect_s3(cancel).await?;
        let snapshot_dir = self.config.snapshot_dir();

        // Resolve every name before touching anything
        let mut plan = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            let path = snapshot_dir.join(name);
            let local = cancellable(cancel, async {
                Ok(tokio::fs::try_exists(&path).await?)
            })
            .await?;
            let remote = match (s3.as_ref(), self.config.s3()) {
                (Some(client), Some(cfg)) => {
                    let key = cfg.object_key(name);
                    client.object_exists(&key).await?.then_some(key)
                }
                _ => None,
            };

            if !local && remote.is_none() {
                missing.push(name.clone());
            } else {
                plan.push((name.clone(), local.then_some(path), remote));
            }
        }

        if !missing.is_empty() {
            return Err(Error::SnapshotNotFound(missing));
        }

        let mut report = DeleteReport::default();
        let mut local_only = None;
        let mut failure = None;
        for (name, local, remote) in plan {
            let mut local_gone = false;
            let result = async {
                signals::check(cancel)?;
                if let Some(path) = local {
                    remove_local(cancel, &path).await?;
                    tracing::info!("Removed local snapshot {}", path.display());
                    report.local_files += 1;
                    local_gone = true;
                }
                if let (Some(key), Some(client)) = (remote, s3.as_ref()) {
                    client.delete_object(&key).await?;
                    tracing::info!("Removed snapshot s3://{}/{}", client.bucket(), key);
                    report.remote_objects += 1;
                }
                Ok::<_, Error>(())
            }
            .await;

            if let Err(e) = result {
                tracing::error!("Removing snapshot {} failed: {}", name, e);
                if local_gone {
                    local_only = Some(name.clone());
                }
                failure = Some((name, e));
                break;
            }
            report.removed.push(name);
        }

        // Whatever was removed leaves the index, even when cancelled
        let removed = report.removed.clone();
        self.update_index(&CancellationToken::new(), move |index| {
            for name in &removed {
                index.remove_name(name);
            }
            if let Some(name) = &local_only {
                index.remove_local(name);
            }
        })
        .await?;

        match failure {
            None => Ok(report),
            Some((_, e)) if e.is_cancelled() => Err(e),
            Some((failed, e)) => Err(Error::DeleteFailed {
                removed: report.removed,
                failed,
                source: Box::new(e),
            }),
        }
    }
}

async fn remove_local(cancel: &CancellationToken, path: &Path) -> Result<()> {
    cancellable(cancel, async {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Error::Operation(format!("removing {}: {}", path.display(), e)))
    })
    .await
}

/// Load and sanity-check the store client credentials
pub async fn load_client_tls(cancel: &CancellationToken, paths: &RuntimePaths) -> Result<()> {
    let ca = read_material(cancel, &paths.server_ca).await?;
    let cert = read_material(cancel, &paths.client_cert).await?;
    let key = read_material(cancel, &paths.client_key).await?;

    ensure_certs(&paths.server_ca, &ca)?;
    ensure_certs(&paths.client_cert, &cert)?;

    match rustls_pemfile::private_key(&mut key.as_slice()) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::Tls(format!(
            "{}: no private key found",
            paths.client_key.display()
        ))),
        Err(e) => Err(Error::Tls(format!("{}: {}", paths.client_key.display(), e))),
    }
}

async fn read_material(cancel: &CancellationToken, path: &Path) -> Result<Vec<u8>> {
    cancellable(cancel, async {
        tokio::fs::read(path)
            .await
            .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))
    })
    .await
}

fn ensure_certs(path: &Path, pem: &[u8]) -> Result<()> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(())
}
