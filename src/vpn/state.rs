use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a remote VPN node
pub type NodeId = u64;

/// Connection phase as reported by the daemon's `>STATE:` notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Connected,
    Reconnecting,
    Wait,
    Auth,
    GetConfig,
    AssignIp,
    AddRoutes,
    Exiting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Reconnecting => "reconnecting",
            Phase::Wait => "wait",
            Phase::Auth => "auth",
            Phase::GetConfig => "get_config",
            Phase::AssignIp => "assign_ip",
            Phase::AddRoutes => "add_routes",
            Phase::Exiting => "exiting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase names outside the known set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connecting" => Ok(Phase::Connecting),
            "connected" => Ok(Phase::Connected),
            "reconnecting" => Ok(Phase::Reconnecting),
            "wait" => Ok(Phase::Wait),
            "auth" => Ok(Phase::Auth),
            "get_config" => Ok(Phase::GetConfig),
            "assign_ip" => Ok(Phase::AssignIp),
            "add_routes" => Ok(Phase::AddRoutes),
            "exiting" => Ok(Phase::Exiting),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

/// A parsed `>STATE:` notification, before it is tied to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    pub observed_at: i64,
    pub phase: Phase,
    pub detail: String,
    pub local_address: String,
    pub remote_address: String,
}

impl StateReport {
    pub fn for_node(self, node_id: NodeId) -> ConnectionState {
        ConnectionState {
            observed_at: self.observed_at,
            phase: self.phase,
            phase_detail: self.detail,
            local_address: self.local_address,
            remote_address: self.remote_address,
            node_id,
        }
    }
}

/// Most recent connection state of the active node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Unix time reported by the daemon
    pub observed_at: i64,
    pub phase: Phase,
    pub phase_detail: String,
    pub local_address: String,
    pub remote_address: String,
    pub node_id: NodeId,
}

impl ConnectionState {
    /// The daemon timestamp as a UTC date, if it is in range
    pub fn observed_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.observed_at, 0)
    }
}

/// Most recent byte counters of the active node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub node_id: NodeId,
}

/// Tag of an [`AuthCredential`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    None,
    UserPass,
    Token,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::None => f.write_str("none"),
            CredentialKind::UserPass => f.write_str("userpass"),
            CredentialKind::Token => f.write_str("token"),
        }
    }
}

/// Credential answered to the daemon's password challenges
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthCredential {
    #[default]
    None,
    UserPass { username: String, password: String },
    Token {
        #[serde(rename = "token")]
        value: String,
    },
}

impl AuthCredential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            AuthCredential::None => CredentialKind::None,
            AuthCredential::UserPass { .. } => CredentialKind::UserPass,
            AuthCredential::Token { .. } => CredentialKind::Token,
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthCredential::None => f.write_str("None"),
            AuthCredential::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthCredential::Token { .. } => f
                .debug_struct("Token")
                .field("value", &"<redacted>")
                .finish(),
        }
    }
}
