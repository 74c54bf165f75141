//! Snapshot save/delete workflows
//!
//! Each invocation moves through a fixed sequence of states, encoded in
//! the type of [`Invocation`]:
//!
//! ```text
//! save:   Unresolved -> ConfigReady<Save> -> InitChecked -> Bootstrapped -> report
//! delete: Unresolved -> ConfigReady<Delete> -> Deleting -> report
//! ```
//!
//! Deleting never checks initialization and never reconciles cluster
//! files; it only needs the admin credential context.

use crate::common::signals::{self, cancellable};
use crate::common::{resolve, ControlConfig, Error, Result, S3Options};
use crate::coordinator::{AdminContext, ClusterCoordinator, ClusterView, StoreCoordinator};
use crate::store::{DeleteReport, LocalStoreClient, SnapshotEntry, SnapshotReport, StoreClient};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the caller supplies for one invocation
#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    /// Empty means "use the hostname"
    pub node_name: String,
    pub data_dir: Option<PathBuf>,
    pub snapshot_name: Option<String>,
    pub snapshot_dir: Option<PathBuf>,
    pub s3: S3Options,
    pub retention: u32,
    /// Positional arguments: snapshot names for delete, nothing for save
    pub args: Vec<String>,
}

/// Marker for the save workflow
#[derive(Debug)]
pub struct Save;

/// Marker for the delete workflow
#[derive(Debug)]
pub struct Delete;

pub struct Unresolved {
    request: SnapshotRequest,
}

pub struct ConfigReady<Op> {
    config: Arc<ControlConfig>,
    names: Vec<String>,
    _op: PhantomData<Op>,
}

pub struct InitChecked<S> {
    config: Arc<ControlConfig>,
    store: S,
}

pub struct Bootstrapped<S> {
    config: Arc<ControlConfig>,
    store: S,
    view: ClusterView,
    admin: AdminContext,
}

pub struct Deleting<S> {
    store: S,
    names: Vec<String>,
    admin: AdminContext,
}

pub struct Invocation<State> {
    cancel: CancellationToken,
    state: State,
}

impl<State> Invocation<State> {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Invocation<Unresolved> {
    pub fn new(request: SnapshotRequest, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            state: Unresolved { request },
        }
    }

    /// Save takes no positional arguments; retention is never applied here
    pub fn resolve_save(self) -> Result<Invocation<ConfigReady<Save>>> {
        if !self.state.request.args.is_empty() {
            return Err(Error::Usage(
                "this command does not take any arguments".into(),
            ));
        }
        let mut request = self.state.request;
        if request.retention != 0 {
            tracing::debug!("Ignoring retention {} for save", request.retention);
        }
        request.retention = 0;
        Self::ready(self.cancel, request, Vec::new())
    }

    pub fn resolve_delete(self) -> Result<Invocation<ConfigReady<Delete>>> {
        if self.state.request.args.is_empty() {
            return Err(Error::Usage("no snapshots given for removal".into()));
        }
        let mut request = self.state.request;
        let names = std::mem::take(&mut request.args);
        Self::ready(self.cancel, request, names)
    }

    fn ready<Op>(
        cancel: CancellationToken,
        request: SnapshotRequest,
        names: Vec<String>,
    ) -> Result<Invocation<ConfigReady<Op>>> {
        signals::check(&cancel)?;
        let config = build_config(request)?;
        Ok(Invocation {
            cancel,
            state: ConfigReady {
                config: Arc::new(config),
                names,
                _op: PhantomData,
            },
        })
    }
}

fn build_config(request: SnapshotRequest) -> Result<ControlConfig> {
    let resolved = resolve::resolve(&request.node_name, request.data_dir.as_deref())?;
    ControlConfig::builder(resolved.node_name, resolved.data_dir)
        .snapshot_name(request.snapshot_name)
        .snapshot_dir(request.snapshot_dir)
        .s3(request.s3)
        .retention(request.retention)
        .build()
}

impl<Op> Invocation<ConfigReady<Op>> {
    pub fn config(&self) -> &Arc<ControlConfig> {
        &self.state.config
    }
}

impl Invocation<ConfigReady<Save>> {
    /// Refuse to continue unless the store already holds state
    pub async fn check_initialized<S: StoreClient>(
        self,
        store: S,
    ) -> Result<Invocation<InitChecked<S>>> {
        let config = self.state.config;
        let initialized =
            cancellable(&self.cancel, store.is_initialized(&self.cancel, &config)).await?;
        if !initialized {
            return Err(Error::NotInitialized);
        }
        tracing::debug!("Managed store for {} is initialized", config.node_name());

        Ok(Invocation {
            cancel: self.cancel,
            state: InitChecked { config, store },
        })
    }
}

impl<S: StoreClient> Invocation<InitChecked<S>> {
    /// Reconcile cluster state, then load the admin credential context
    pub async fn bootstrap<C: ClusterCoordinator>(
        self,
        coordinator: &C,
    ) -> Result<Invocation<Bootstrapped<S>>> {
        let InitChecked { config, store } = self.state;
        let view = cancellable(&self.cancel, coordinator.bootstrap(&self.cancel))
            .await
            .map_err(Error::into_bootstrap)?;
        let admin = AdminContext::load(&self.cancel, &config.runtime().admin_kubeconfig)
            .await
            .map_err(Error::into_bootstrap)?;

        Ok(Invocation {
            cancel: self.cancel,
            state: Bootstrapped {
                config,
                store,
                view,
                admin,
            },
        })
    }
}

impl<S: StoreClient> Invocation<Bootstrapped<S>> {
    pub fn view(&self) -> &ClusterView {
        &self.state.view
    }

    pub fn admin(&self) -> &AdminContext {
        &self.state.admin
    }

    pub async fn snapshot(self) -> Result<SnapshotReport> {
        let state = self.state;
        signals::check(&self.cancel)?;
        tracing::info!(
            "Taking snapshot on {} (cluster {}, admin context {})",
            state.config.node_name(),
            state.view.cluster_id,
            state.admin.context
        );
        cancellable(
            &self.cancel,
            state.store.snapshot(&self.cancel, &state.config),
        )
        .await
    }
}

impl Invocation<ConfigReady<Delete>> {
    /// Load the admin credential context. No init gate, no reconcile.
    pub async fn open_admin<S: StoreClient>(self, store: S) -> Result<Invocation<Deleting<S>>> {
        let ConfigReady { config, names, .. } = self.state;
        let admin = AdminContext::load(&self.cancel, &config.runtime().admin_kubeconfig)
            .await
            .map_err(Error::into_bootstrap)?;

        Ok(Invocation {
            cancel: self.cancel,
            state: Deleting {
                store,
                names,
                admin,
            },
        })
    }
}

impl<S: StoreClient> Invocation<Deleting<S>> {
    pub fn names(&self) -> &[String] {
        &self.state.names
    }

    pub async fn delete(self) -> Result<DeleteReport> {
        let state = self.state;
        signals::check(&self.cancel)?;
        tracing::info!(
            "Deleting {} snapshot(s) as {}",
            state.names.len(),
            state.admin.user
        );
        cancellable(
            &self.cancel,
            state.store.delete_snapshots(&self.cancel, &state.names),
        )
        .await
    }
}

/// Drive a resolved save invocation to completion
pub async fn run_save<S, C>(
    ready: Invocation<ConfigReady<Save>>,
    store: S,
    coordinator: &C,
) -> Result<SnapshotReport>
where
    S: StoreClient,
    C: ClusterCoordinator,
{
    ready
        .check_initialized(store)
        .await?
        .bootstrap(coordinator)
        .await?
        .snapshot()
        .await
}

/// Drive a resolved delete invocation to completion
pub async fn run_delete<S: StoreClient>(
    ready: Invocation<ConfigReady<Delete>>,
    store: S,
) -> Result<DeleteReport> {
    ready.open_admin(store).await?.delete().await
}

/// Save a snapshot of the managed store
pub async fn save(request: SnapshotRequest, cancel: CancellationToken) -> Result<SnapshotReport> {
    let ready = Invocation::new(request, cancel).resolve_save()?;
    let config = ready.config().clone();
    let coordinator = StoreCoordinator::new(config.clone());
    run_save(ready, LocalStoreClient::new(config), &coordinator).await
}

/// Delete the snapshots named in `request.args`
pub async fn delete(request: SnapshotRequest, cancel: CancellationToken) -> Result<DeleteReport> {
    let ready = Invocation::new(request, cancel).resolve_delete()?;
    let store = LocalStoreClient::new(ready.config().clone());
    run_delete(ready, store).await
}

/// List known snapshots, newest first
pub fn list(request: SnapshotRequest) -> Result<Vec<SnapshotEntry>> {
    if !request.args.is_empty() {
        return Err(Error::Usage(
            "this command does not take any arguments".into(),
        ));
    }
    let config = build_config(request)?;
    LocalStoreClient::new(Arc::new(config)).list_snapshots()
}
