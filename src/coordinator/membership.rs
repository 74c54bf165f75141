//! Cluster record persisted in the store
//!
//! The record lists cluster members and the shared credential/TLS files
//! every member must hold. It lives under [`CLUSTER_RECORD_KEY`] as JSON.

use crate::common::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};

pub const CLUSTER_RECORD_KEY: &str = "/bootstrap/cluster";

/// Top-level directories a cluster record may write into
const ALLOWED_ROOTS: &[&str] = &["tls", "cred"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    #[serde(default)]
    pub peer_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFile {
    /// Base64 file contents
    pub content: String,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: String,
    #[serde(default)]
    pub members: Vec<Member>,
    /// Path relative to the data directory -> contents
    #[serde(default)]
    pub files: BTreeMap<String, ClusterFile>,
}

impl ClusterRecord {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Corrupted(format!("cluster record: {}", e)))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Operation(format!("cluster record encode failed: {}", e)))
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }

    /// Check the record is usable by `node_name` and decode its files.
    /// Nothing is written here.
    pub fn validate(&self, node_name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        if self.cluster_id.trim().is_empty() {
            return Err(Error::bootstrap("cluster record has no cluster id"));
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if member.name.is_empty() {
                return Err(Error::bootstrap("cluster member with empty name"));
            }
            if !seen.insert(member.name.as_str()) {
                return Err(Error::bootstrap(format!(
                    "duplicate cluster member {}",
                    member.name
                )));
            }
        }

        if !self.members.is_empty() && !self.has_member(node_name) {
            return Err(Error::bootstrap(format!(
                "node {} is not a member of cluster {}",
                node_name, self.cluster_id
            )));
        }

        let mut decoded = BTreeMap::new();
        for (path, file) in &self.files {
            validate_file_path(path)?;
            let bytes = BASE64.decode(file.content.trim()).map_err(|e| {
                Error::bootstrap(format!("file {} has invalid contents: {}", path, e))
            })?;
            decoded.insert(path.clone(), bytes);
        }
        Ok(decoded)
    }
}

fn validate_file_path(path: &str) -> Result<()> {
    let invalid = |why: &str| Error::bootstrap(format!("invalid file path {:?}: {}", path, why));

    let mut components = Path::new(path).components();
    match components.next() {
        Some(Component::Normal(root)) if ALLOWED_ROOTS.iter().any(|r| root == *r) => {}
        Some(Component::Normal(_)) => return Err(invalid("outside tls/ and cred/")),
        _ => return Err(invalid("must be relative")),
    }

    let mut depth = 0;
    for component in components {
        match component {
            Component::Normal(_) => depth += 1,
            _ => return Err(invalid("must not contain '..' or '.'")),
        }
    }
    if depth == 0 {
        return Err(invalid("names a directory"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ClusterRecord {
        let mut files = BTreeMap::new();
        files.insert(
            "tls/etcd/server-ca.crt".to_string(),
            ClusterFile {
                content: BASE64.encode(b"ca"),
                updated_at: 1,
            },
        );
        ClusterRecord {
            cluster_id: "c-1".into(),
            members: vec![
                Member {
                    name: "node-a".into(),
                    peer_url: "https://10.0.0.1:2380".into(),
                },
                Member {
                    name: "node-b".into(),
                    peer_url: "https://10.0.0.2:2380".into(),
                },
            ],
            files,
        }
    }

    #[test]
    fn test_validate_decodes_files() {
        let files = record().validate("node-a").unwrap();
        assert_eq!(files["tls/etcd/server-ca.crt"], b"ca");
    }

    #[test]
    fn test_non_member_rejected() {
        let err = record().validate("node-z").unwrap_err();
        assert!(matches!(err, Error::Bootstrap { .. }));
    }

    #[test]
    fn test_memberless_record_accepts_any_node() {
        let mut r = record();
        r.members.clear();
        assert!(r.validate("anyone").is_ok());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut r = record();
        r.members[1].name = "node-a".into();
        assert!(r.validate("node-a").is_err());
    }

    #[test]
    fn test_file_paths() {
        assert!(validate_file_path("tls/etcd/client.crt").is_ok());
        assert!(validate_file_path("cred/admin.kubeconfig").is_ok());
        assert!(validate_file_path("/etc/passwd").is_err());
        assert!(validate_file_path("tls/../../etc/passwd").is_err());
        assert!(validate_file_path("db/store/member/wal/wal.log").is_err());
        assert!(validate_file_path("tls").is_err());
    }

    #[test]
    fn test_bad_base64_rejected() {
        let mut r = record();
        r.files.get_mut("tls/etcd/server-ca.crt").unwrap().content = "***".into();
        assert!(r.validate("node-a").is_err());
    }

    #[test]
    fn test_json() {
        let r = record();
        let decoded = ClusterRecord::from_json(&r.to_json().unwrap()).unwrap();
        assert_eq!(decoded, r);
        assert!(matches!(
            ClusterRecord::from_json(b"{"),
            Err(Error::Corrupted(_))
        ));
    }
}
