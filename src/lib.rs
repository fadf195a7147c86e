//! vpnctl - VPN Connection Control Library
//!
//! Async library for running a single OpenVPN connection on behalf of a
//! local UI:
//! - Daemon process supervision with a private per-attempt config file
//! - OpenVPN management interface client (state, byte counts, hold release,
//!   password challenges)
//! - Connection lifecycle with state and bandwidth snapshots
//! - Broadcast event fan-out to subscribers

pub mod error;
pub mod config;
pub mod events;
pub mod vpn;

// Re-export commonly used types
pub use error::{ProtocolError, VpnctlError, VpnctlResult};
pub use config::{ControllerSettings, VpnctlConfig};
pub use events::{EventBus, VpnEvent};
pub use vpn::{
    AuthCredential, BandwidthSample, ConfigFetcher, ConnectPermission, ConnectionController,
    ConnectionState, CredentialProvider, NodeId, Phase, StartOutcome,
};
