//! Administrative credential context
//!
//! Loaded from `cred/admin.kubeconfig` before any terminal operation. Only
//! the current context is resolved; secrets are checked for presence and
//! never kept.

use crate::common::{cancellable, Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use config::{Config, File, FileFormat};
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: String,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: T,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserEntry {
    #[serde(rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<PathBuf>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// How the admin identity authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAuth {
    ClientCertificate,
    Token,
    Basic { username: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminContext {
    pub context: String,
    pub cluster: String,
    pub user: String,
    pub server: Url,
    pub auth: AdminAuth,
    pub insecure: bool,
}

impl AdminContext {
    pub async fn load(cancel: &CancellationToken, path: &Path) -> Result<Self> {
        let text = cancellable(cancel, async {
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::Credential(format!("{}: {}", path.display(), e)))
        })
        .await?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let ctx = Self::parse(&text, base)?;
        tracing::info!(
            "Loaded admin context {} for {} (user {})",
            ctx.context,
            ctx.server,
            ctx.user
        );
        Ok(ctx)
    }

    /// Relative file references resolve against `base`
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let kubeconfig: Kubeconfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Yaml))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| Error::Credential(format!("invalid admin kubeconfig: {}", e)))?;

        if kubeconfig.current_context.is_empty() {
            return Err(Error::Credential("admin kubeconfig has no current-context".into()));
        }
        let context = find(&kubeconfig.contexts, &kubeconfig.current_context, "context")?;
        let cluster = find(&kubeconfig.clusters, &context.cluster, "cluster")?;
        let user = find(&kubeconfig.users, &context.user, "user")?;

        let server = Url::parse(&cluster.server).map_err(|e| {
            Error::Credential(format!("cluster {} has invalid server: {}", context.cluster, e))
        })?;
        if server.scheme() != "https" && server.scheme() != "http" {
            return Err(Error::Credential(format!(
                "cluster {} server must be http(s), got {}",
                context.cluster,
                server.scheme()
            )));
        }

        check_material(
            "certificate-authority",
            cluster.certificate_authority.as_deref(),
            cluster.certificate_authority_data.as_deref(),
            base,
        )?;

        Ok(Self {
            context: kubeconfig.current_context.clone(),
            cluster: context.cluster.clone(),
            user: context.user.clone(),
            server,
            auth: user_auth(&context.user, user, base)?,
            insecure: cluster.insecure_skip_tls_verify,
        })
    }
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str, what: &str) -> Result<&'a T> {
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| &e.value)
        .ok_or_else(|| Error::Credential(format!("admin kubeconfig has no {} {:?}", what, name)))
}

fn user_auth(name: &str, user: &UserEntry, base: &Path) -> Result<AdminAuth> {
    let has_cert = user.client_certificate.is_some() || user.client_certificate_data.is_some();
    let has_key = user.client_key.is_some() || user.client_key_data.is_some();

    match (has_cert, has_key) {
        (true, true) => {
            check_material(
                "client-certificate",
                user.client_certificate.as_deref(),
                user.client_certificate_data.as_deref(),
                base,
            )?;
            check_material(
                "client-key",
                user.client_key.as_deref(),
                user.client_key_data.as_deref(),
                base,
            )?;
            return Ok(AdminAuth::ClientCertificate);
        }
        (true, false) | (false, true) => {
            return Err(Error::Credential(format!(
                "user {} needs both a client certificate and key",
                name
            )))
        }
        (false, false) => {}
    }

    if user.token.as_deref().is_some_and(|t| !t.is_empty()) {
        return Ok(AdminAuth::Token);
    }
    if let (Some(username), Some(_)) = (&user.username, &user.password) {
        return Ok(AdminAuth::Basic {
            username: username.clone(),
        });
    }
    Err(Error::Credential(format!("user {} has no credentials", name)))
}

fn check_material(what: &str, file: Option<&Path>, data: Option<&str>, base: &Path) -> Result<()> {
    if let Some(data) = data {
        BASE64
            .decode(data.trim())
            .map_err(|e| Error::Credential(format!("{}-data is not valid base64: {}", what, e)))?;
    } else if let Some(file) = file {
        let path = base.join(file);
        if !path.is_file() {
            return Err(Error::Credential(format!(
                "{} {} does not exist",
                what,
                path.display()
            )));
        }
    }
    Ok(())
}
