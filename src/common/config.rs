//! Configuration for kvsnap invocations
//!
//! A [`ControlConfig`] is built once per invocation through
//! [`ControlConfigBuilder`] and never mutated afterwards. Flag values
//! come from the CLI, falling back to [`FileConfig`] (config file plus
//! `KVSNAP__*` environment) and finally to the defaults below.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_SNAPSHOT_NAME: &str = "etcd-snapshot";
pub const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Resolved, existing data directory (`<root>/server`).
///
/// Only [`crate::common::resolve::resolve_data_dir`] hands these out, so
/// holding one means the directory has been created or verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir(PathBuf);

impl DataDir {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Root of all store-owned state
    pub fn db_dir(&self) -> PathBuf {
        self.0.join("db")
    }

    /// Managed store directory
    pub fn store_dir(&self) -> PathBuf {
        self.db_dir().join("store")
    }

    pub fn default_snapshot_dir(&self) -> PathBuf {
        self.db_dir().join("snapshots")
    }

    /// Snapshot manifest location
    pub fn index_path(&self) -> PathBuf {
        self.db_dir().join("snapshot-index.json")
    }
}

/// Credential and TLS material locations derived from the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub server_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub admin_kubeconfig: PathBuf,
}

impl RuntimePaths {
    pub fn for_data_dir(data_dir: &DataDir) -> Self {
        let tls = data_dir.path().join("tls").join("etcd");
        let cred = data_dir.path().join("cred");
        Self {
            server_ca: tls.join("server-ca.crt"),
            client_cert: tls.join("client.crt"),
            client_key: tls.join("client.key"),
            admin_kubeconfig: cred.join("admin.kubeconfig"),
        }
    }
}

/// Raw S3 settings as given on the command line or in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Options {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub endpoint_ca: Option<PathBuf>,
    pub skip_verify: bool,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub folder: Option<String>,
}

/// Validated S3 backend configuration. Present only when S3 is enabled.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: String,
    pub endpoint_ca: Option<PathBuf>,
    pub skip_verify: bool,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub folder: String,
}

impl S3Config {
    /// Object key for a snapshot name, honoring the folder prefix
    pub fn object_key(&self, name: &str) -> String {
        let folder = self.folder.trim_matches('/');
        if folder.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", folder, name)
        }
    }

    fn from_options(opts: S3Options) -> Result<Option<Self>> {
        if !opts.enabled {
            return Ok(None);
        }

        let bucket = non_empty(opts.bucket)
            .ok_or_else(|| Error::InvalidConfig("S3 is enabled but no bucket was given".into()))?;
        let (access_key, secret_key) = match (non_empty(opts.access_key), non_empty(opts.secret_key))
        {
            (Some(a), Some(s)) => (a, s),
            _ => {
                return Err(Error::InvalidConfig(
                    "S3 is enabled but access key and secret key are not both set".into(),
                ))
            }
        };
        if opts.endpoint_ca.is_some() && opts.skip_verify {
            return Err(Error::InvalidConfig(
                "S3 endpoint CA and skip-ssl-verify are mutually exclusive".into(),
            ));
        }

        let region = opts.region.unwrap_or_else(|| DEFAULT_S3_REGION.to_string());
        if region.trim().is_empty() {
            return Err(Error::InvalidConfig("S3 region cannot be empty".into()));
        }

        Ok(Some(Self {
            endpoint: non_empty(opts.endpoint).unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string()),
            endpoint_ca: opts.endpoint_ca,
            skip_verify: opts.skip_verify,
            access_key,
            secret_key,
            bucket,
            region,
            folder: opts.folder.unwrap_or_default(),
        }))
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("endpoint_ca", &self.endpoint_ca)
            .field("skip_verify", &self.skip_verify)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("folder", &self.folder)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Configuration governing a single invocation
#[derive(Debug, Clone)]
pub struct ControlConfig {
    node_name: String,
    data_dir: DataDir,
    snapshot_name: String,
    snapshot_dir: PathBuf,
    s3: Option<S3Config>,
    retention: u32,
    runtime: RuntimePaths,
}

impl ControlConfig {
    pub fn builder(node_name: impl Into<String>, data_dir: DataDir) -> ControlConfigBuilder {
        ControlConfigBuilder {
            node_name: node_name.into(),
            data_dir,
            snapshot_name: None,
            snapshot_dir: None,
            s3: S3Options::default(),
            retention: 0,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn s3(&self) -> Option<&S3Config> {
        self.s3.as_ref()
    }

    /// Retention count; 0 disables pruning
    pub fn retention(&self) -> u32 {
        self.retention
    }

    pub fn runtime(&self) -> &RuntimePaths {
        &self.runtime
    }
}

pub struct ControlConfigBuilder {
    node_name: String,
    data_dir: DataDir,
    snapshot_name: Option<String>,
    snapshot_dir: Option<PathBuf>,
    s3: S3Options,
    retention: u32,
}

impl ControlConfigBuilder {
    pub fn snapshot_name(mut self, name: Option<String>) -> Self {
        self.snapshot_name = name;
        self
    }

    pub fn snapshot_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.snapshot_dir = dir;
        self
    }

    pub fn s3(mut self, s3: S3Options) -> Self {
        self.s3 = s3;
        self
    }

    pub fn retention(mut self, retention: u32) -> Self {
        self.retention = retention;
        self
    }

    pub fn build(self) -> Result<ControlConfig> {
        if self.node_name.trim().is_empty() {
            return Err(Error::InvalidConfig("node name cannot be empty".into()));
        }

        let snapshot_name =
            non_empty(self.snapshot_name).unwrap_or_else(|| DEFAULT_SNAPSHOT_NAME.to_string());
        if snapshot_name.contains('/') || snapshot_name.contains('\\') {
            return Err(Error::InvalidConfig(format!(
                "snapshot name {:?} must not contain a path separator",
                snapshot_name
            )));
        }

        // Relative snapshot directories live under the data directory
        let snapshot_dir = match self.snapshot_dir {
            Some(dir) if dir.as_os_str().is_empty() => self.data_dir.default_snapshot_dir(),
            Some(dir) if dir.is_relative() => self.data_dir.path().join(dir),
            Some(dir) => dir,
            None => self.data_dir.default_snapshot_dir(),
        };

        let s3 = S3Config::from_options(self.s3)?;
        let runtime = RuntimePaths::for_data_dir(&self.data_dir);

        Ok(ControlConfig {
            node_name: self.node_name,
            data_dir: self.data_dir,
            snapshot_name,
            snapshot_dir,
            s3,
            retention: self.retention,
            runtime,
        })
    }
}

/// Snapshot section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub name: Option<String>,
    pub dir: Option<PathBuf>,
    pub retention: Option<u32>,
}

/// Optional settings read from a config file and `KVSNAP__*` variables
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub node_name: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub snapshot: SnapshotSection,
    pub s3: S3Options,
}

impl FileConfig {
    /// Load from an optional TOML/YAML file, then overlay the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("KVSNAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn data_dir(root: &Path) -> DataDir {
        DataDir::new(root.join("server"))
    }

    fn s3_options() -> S3Options {
        S3Options {
            enabled: true,
            access_key: Some("AKIA".into()),
            secret_key: Some("secret".into()),
            bucket: Some("backups".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let dir = tempdir().unwrap();
        let cfg = ControlConfig::builder("node-a", data_dir(dir.path()))
            .build()
            .unwrap();

        assert_eq!(cfg.snapshot_name(), DEFAULT_SNAPSHOT_NAME);
        assert_eq!(
            cfg.snapshot_dir(),
            dir.path().join("server").join("db").join("snapshots")
        );
        assert!(cfg.s3().is_none());
        assert_eq!(cfg.retention(), 0);
    }

    #[test]
    fn test_runtime_paths() {
        let dir = tempdir().unwrap();
        let cfg = ControlConfig::builder("node-a", data_dir(dir.path()))
            .build()
            .unwrap();
        let server = dir.path().join("server");

        let rt = cfg.runtime();
        assert_eq!(rt.server_ca, server.join("tls/etcd/server-ca.crt"));
        assert_eq!(rt.client_cert, server.join("tls/etcd/client.crt"));
        assert_eq!(rt.client_key, server.join("tls/etcd/client.key"));
        assert_eq!(rt.admin_kubeconfig, server.join("cred/admin.kubeconfig"));
    }

    #[test]
    fn test_relative_snapshot_dir() {
        let dir = tempdir().unwrap();
        let cfg = ControlConfig::builder("node-a", data_dir(dir.path()))
            .snapshot_dir(Some(PathBuf::from("backups")))
            .build()
            .unwrap();
        assert_eq!(cfg.snapshot_dir(), dir.path().join("server").join("backups"));
    }

    #[test]
    fn test_rejects_bad_snapshot_name() {
        let dir = tempdir().unwrap();
        let err = ControlConfig::builder("node-a", data_dir(dir.path()))
            .snapshot_name(Some("../evil".into()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_s3_requires_credentials() {
        let dir = tempdir().unwrap();
        let mut opts = s3_options();
        opts.secret_key = None;
        let err = ControlConfig::builder("node-a", data_dir(dir.path()))
            .s3(opts)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("secret key"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let dir = tempdir().unwrap();
        let mut opts = s3_options();
        opts.bucket = Some("  ".into());
        assert!(ControlConfig::builder("node-a", data_dir(dir.path()))
            .s3(opts)
            .build()
            .is_err());
    }

    #[test]
    fn test_s3_ca_and_skip_verify_conflict() {
        let dir = tempdir().unwrap();
        let mut opts = s3_options();
        opts.endpoint_ca = Some(PathBuf::from("/etc/ca.pem"));
        opts.skip_verify = true;
        assert!(ControlConfig::builder("node-a", data_dir(dir.path()))
            .s3(opts)
            .build()
            .is_err());
    }

    #[test]
    fn test_s3_disabled_ignores_fields() {
        let dir = tempdir().unwrap();
        let opts = S3Options {
            enabled: false,
            bucket: Some("ignored".into()),
            ..Default::default()
        };
        let cfg = ControlConfig::builder("node-a", data_dir(dir.path()))
            .s3(opts)
            .build()
            .unwrap();
        assert!(cfg.s3().is_none());
    }

    #[test]
    fn test_s3_defaults_and_object_key() {
        let dir = tempdir().unwrap();
        let mut opts = s3_options();
        opts.folder = Some("/nightly/".into());
        let cfg = ControlConfig::builder("node-a", data_dir(dir.path()))
            .s3(opts)
            .build()
            .unwrap();

        let s3 = cfg.s3().unwrap();
        assert_eq!(s3.endpoint, DEFAULT_S3_ENDPOINT);
        assert_eq!(s3.region, DEFAULT_S3_REGION);
        assert_eq!(s3.object_key("snap-1"), "nightly/snap-1");
    }

    #[test]
    fn test_secret_redacted() {
        let dir = tempdir().unwrap();
        let cfg = ControlConfig::builder("node-a", data_dir(dir.path()))
            .s3(s3_options())
            .build()
            .unwrap();
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("\"secret\""));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_file_config_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kvsnap.toml");
        std::fs::write(
            &path,
            "node_name = 'node-b'\n\n[snapshot]\nname = 'nightly'\n\n[s3]\nenabled = true\nbucket = 'backups'\n",
        )
        .unwrap();

        let file = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(file.node_name.as_deref(), Some("node-b"));
        assert_eq!(file.snapshot.name.as_deref(), Some("nightly"));
        assert!(file.s3.enabled);
        assert_eq!(file.s3.bucket.as_deref(), Some("backups"));
    }

    #[test]
    fn test_file_config_missing_file() {
        let dir = tempdir().unwrap();
        assert!(FileConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
