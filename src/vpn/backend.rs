use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{VpnctlError, VpnctlResult};
use super::state::{AuthCredential, NodeId};

/// Answer of the remote service to "may this session use node N"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPermission {
    pub permitted: bool,
    #[serde(default)]
    pub message: String,
}

impl ConnectPermission {
    pub fn granted(message: impl Into<String>) -> Self {
        Self {
            permitted: true,
            message: message.into(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            permitted: false,
            message: message.into(),
        }
    }
}

/// Source of node authorization and per-node credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Whether a remote session is established
    fn is_logged_in(&self) -> bool;

    /// Credential answered to the daemon's password challenge, if any
    fn get_node_auth(&self) -> Option<AuthCredential>;

    /// Ask whether `node_id` may be used.
    ///
    /// A refusal is a normal result, not an error.
    async fn can_connect(&self, node_id: NodeId) -> VpnctlResult<ConnectPermission>;
}

/// Source of per-node daemon configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    /// Daemon configuration text for `node_id`; `None` when unknown
    async fn get_config(&self, node_id: NodeId) -> VpnctlResult<Option<String>>;
}

/// Credential provider backed by local configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credential: AuthCredential,
    allowed_nodes: Option<HashSet<NodeId>>,
}

impl StaticCredentials {
    pub fn new(credential: AuthCredential) -> Self {
        Self {
            credential,
            allowed_nodes: None,
        }
    }

    /// Refuse every node not listed
    pub fn with_allowed_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.allowed_nodes = Some(nodes.into_iter().collect());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn is_logged_in(&self) -> bool {
        true
    }

    fn get_node_auth(&self) -> Option<AuthCredential> {
        match self.credential {
            AuthCredential::None => None,
            ref credential => Some(credential.clone()),
        }
    }

    async fn can_connect(&self, node_id: NodeId) -> VpnctlResult<ConnectPermission> {
        match &self.allowed_nodes {
            Some(nodes) if !nodes.contains(&node_id) => Ok(ConnectPermission::denied(format!(
                "Node {} is not in the allowed node list",
                node_id
            ))),
            _ => Ok(ConnectPermission::granted("")),
        }
    }
}

/// Config fetcher reading `<dir>/<node_id>.ovpn`
#[derive(Debug, Clone)]
pub struct DirectoryConfigFetcher {
    dir: PathBuf,
}

impl DirectoryConfigFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn config_path(&self, node_id: NodeId) -> PathBuf {
        self.dir.join(format!("{}.ovpn", node_id))
    }
}

#[async_trait]
impl ConfigFetcher for DirectoryConfigFetcher {
    async fn get_config(&self, node_id: NodeId) -> VpnctlResult<Option<String>> {
        let path = self.config_path(node_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration file at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(VpnctlError::Provider(format!(
                "Failed to read {:?}: {}",
                path, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_permission_from_json() {
        let permission: ConnectPermission =
            serde_json::from_str(r#"{"permitted":false,"message":"Subscription expired"}"#).unwrap();
        assert_eq!(permission, ConnectPermission::denied("Subscription expired"));

        let permission: ConnectPermission = serde_json::from_str(r#"{"permitted":true}"#).unwrap();
        assert!(permission.permitted);
        assert!(permission.message.is_empty());
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let provider = StaticCredentials::default();
        assert!(provider.is_logged_in());
        assert_eq!(provider.get_node_auth(), None);
        assert!(provider.can_connect(3).await.unwrap().permitted);

        let provider = StaticCredentials::new(AuthCredential::Token { value: "t".to_string() })
            .with_allowed_nodes([1, 2]);
        assert_eq!(
            provider.get_node_auth(),
            Some(AuthCredential::Token { value: "t".to_string() })
        );
        assert!(provider.can_connect(2).await.unwrap().permitted);
        let refused = provider.can_connect(3).await.unwrap();
        assert!(!refused.permitted);
        assert!(refused.message.contains('3'));
    }

    #[tokio::test]
    async fn test_directory_fetcher() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("7.ovpn"), "client\nremote vpn.example.net 1194\n").unwrap();

        let fetcher = DirectoryConfigFetcher::new(dir.path());
        let config = fetcher.get_config(7).await.unwrap();
        assert!(config.unwrap().contains("remote vpn.example.net"));
        assert_eq!(fetcher.get_config(8).await.unwrap(), None);
    }
}
