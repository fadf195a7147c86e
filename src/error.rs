//! Error types for vpnctl

use std::io;
use thiserror::Error;

use crate::vpn::state::{CredentialKind, NodeId};

/// Failures of a management-interface session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The management port could not be opened
    #[error("Cannot connect to management interface on port {port}: {reason}")]
    ConnectFailed { port: u16, reason: String },
    /// The management socket dropped while the session was open
    #[error("Management connection reset: {0}")]
    ConnectionReset(String),
    /// The daemon asked for a credential the session does not hold
    #[error("Authentication mismatch: daemon asked \"{challenge}\" (needs {required}), session holds {held}")]
    AuthMismatch {
        challenge: String,
        required: CredentialKind,
        held: CredentialKind,
    },
    /// A command was sent with no open session
    #[error("Management session is not open")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum VpnctlError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Per-node configuration was absent or empty
    #[error("No configuration available for node {node_id}")]
    ConfigUnavailable { node_id: NodeId },
    /// The daemon executable could not be started
    #[error("Failed to start '{program}': {reason}")]
    ProcessSpawn { program: String, reason: String },
    /// The daemon exited before the management session was attached
    #[error("Daemon terminated during handshake ({status})")]
    ProcessTerminatedDuringHandshake { status: String },
    /// Management protocol failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The attempt was superseded by stop() or a newer start()
    #[error("Connection attempt for node {node_id} was cancelled")]
    Cancelled { node_id: NodeId },
    /// An external collaborator (credential or config source) failed
    #[error("Provider error: {0}")]
    Provider(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for VpnctlError {
    fn from(error: serde_json::Error) -> Self {
        VpnctlError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for VpnctlError {
    fn from(error: toml::de::Error) -> Self {
        VpnctlError::ConfigError(error.to_string())
    }
}

pub type VpnctlResult<T> = Result<T, VpnctlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_mismatch_message() {
        let err = ProtocolError::AuthMismatch {
            challenge: "Need 'Auth' username/password".to_string(),
            required: CredentialKind::UserPass,
            held: CredentialKind::None,
        };
        let msg = err.to_string();
        assert!(msg.contains("userpass"));
        assert!(msg.contains("none"));
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: VpnctlError = ProtocolError::NotConnected.into();
        assert!(matches!(err, VpnctlError::Protocol(ProtocolError::NotConnected)));
    }
}
