//! VPN Module for vpnctl
//!
//! Supervises a local OpenVPN daemon and drives it through its management
//! interface, one node at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        ConnectionController         │ ──► EventBus (VpnEvent)
//! └──────────────┬──────────────────────┘
//!                │
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌──────────────┐  ┌──────────────┐
//! │  Supervisor  │  │ Management   │  <- process / TCP 127.0.0.1
//! └──────────────┘  └──────────────┘
//! ```
//!
//! Node authorization and per-node configuration come from the
//! `CredentialProvider` and `ConfigFetcher` collaborators.
//!
//! # Usage
//!
//! ```rust,no_run
//! use libvpnctl::config::VpnctlConfig;
//! use libvpnctl::vpn::ConnectionController;
//!
//! # async fn run() -> libvpnctl::VpnctlResult<()> {
//! let controller = ConnectionController::from_config(&VpnctlConfig::default());
//! let mut events = controller.subscribe();
//!
//! controller.start(7).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod common;
pub mod controller;
pub mod management;
pub mod state;
pub mod supervisor;

pub use backend::{
    ConfigFetcher, ConnectPermission, CredentialProvider, DirectoryConfigFetcher,
    StaticCredentials,
};
pub use controller::{ConnectionController, StartOutcome};
pub use management::{ProtocolClient, SessionEvent};
pub use state::{AuthCredential, BandwidthSample, ConnectionState, CredentialKind, NodeId, Phase};
pub use supervisor::{DaemonExit, DaemonHandle, ProcessSupervisor};
