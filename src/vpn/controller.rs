//! Connection lifecycle for a single active node.
//!
//! The controller owns the daemon supervisor, the management client, the
//! event bus and the latest state/bandwidth snapshots. Every `start()` and
//! `stop()` bumps an attempt generation; work belonging to an older
//! generation (a late attach, a session update, an exit notification) is
//! discarded instead of touching the current attempt.
//!
//! Locking: `lifecycle` serializes spawn, attach and teardown. It is always
//! taken before `state`, and `state` is never held across an await on
//! `lifecycle`.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ControllerSettings, VpnctlConfig};
use crate::error::{ProtocolError, VpnctlError, VpnctlResult};
use crate::events::{EventBus, VpnEvent};
use super::backend::{ConfigFetcher, CredentialProvider, DirectoryConfigFetcher, StaticCredentials};
use super::management::{ProtocolClient, SessionEvent};
use super::state::{BandwidthSample, ConnectionState, NodeId};
use super::supervisor::{DaemonHandle, ProcessSupervisor};

/// Result of a completed `start()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Daemon running and management session attached
    Connected { message: String },
    /// The credential provider refused the node
    Rejected { message: String },
}

#[derive(Debug, Default)]
struct ControllerState {
    generation: u64,
    daemon: Option<DaemonHandle>,
    node_id: Option<NodeId>,
    latest_state: Option<ConnectionState>,
    latest_bandwidth: Option<BandwidthSample>,
}

struct Shared {
    state: Mutex<ControllerState>,
    lifecycle: Mutex<()>,
    supervisor: ProcessSupervisor,
    protocol: ProtocolClient,
    events: EventBus,
    credentials: Arc<dyn CredentialProvider>,
    configs: Arc<dyn ConfigFetcher>,
    settings: ControllerSettings,
}

/// Drives one VPN connection at a time
#[derive(Clone)]
pub struct ConnectionController {
    shared: Arc<Shared>,
}

impl ConnectionController {
    pub fn new(
        settings: ControllerSettings,
        credentials: Arc<dyn CredentialProvider>,
        configs: Arc<dyn ConfigFetcher>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(
            settings.program.clone(),
            settings.temp_dir.clone(),
            settings.kill_timeout,
        );
        let protocol = ProtocolClient::new(settings.connect_timeout);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState::default()),
                lifecycle: Mutex::new(()),
                supervisor,
                protocol,
                events: EventBus::new(),
                credentials,
                configs,
                settings,
            }),
        }
    }

    /// Controller using the locally configured credential and node directory
    pub fn from_config(config: &VpnctlConfig) -> Self {
        let mut credentials = StaticCredentials::new(config.credentials.auth.clone());
        if let Some(nodes) = &config.credentials.allowed_nodes {
            credentials = credentials.with_allowed_nodes(nodes.iter().copied());
        }

        Self::new(
            config.controller_settings(),
            Arc::new(credentials),
            Arc::new(DirectoryConfigFetcher::new(config.nodes.config_dir.clone())),
        )
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.shared.settings
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.shared.credentials
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.shared.events.subscribe()
    }

    /// Whether a supervised daemon is still alive
    pub async fn is_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .await
            .daemon
            .as_ref()
            .is_some_and(DaemonHandle::is_alive)
    }

    async fn has_daemon(&self) -> bool {
        self.shared.state.lock().await.daemon.is_some()
    }

    /// Node of the attached session
    pub async fn active_node(&self) -> Option<NodeId> {
        self.shared.state.lock().await.node_id
    }

    pub async fn latest_state(&self) -> Option<ConnectionState> {
        self.shared.state.lock().await.latest_state.clone()
    }

    pub async fn latest_bandwidth(&self) -> Option<BandwidthSample> {
        self.shared.state.lock().await.latest_bandwidth
    }

    /// Re-emit the current bandwidth and state snapshots unchanged
    pub async fn republish(&self) {
        let state = self.shared.state.lock().await;
        self.shared.events.publish(VpnEvent::Bandwidth(state.latest_bandwidth));
        self.shared.events.publish(VpnEvent::State(state.latest_state.clone()));
    }

    /// Connect to `node_id`, replacing any running connection
    pub async fn start(&self, node_id: NodeId) -> VpnctlResult<StartOutcome> {
        let generation = self.next_generation().await;

        if self.has_daemon().await {
            info!("Stopping current connection before starting node {}", node_id);
            self.teardown(generation).await;
        }

        let permission = self.shared.credentials.can_connect(node_id).await?;
        if !permission.permitted {
            info!("Connection to node {} refused: {}", node_id, permission.message);
            return Ok(StartOutcome::Rejected {
                message: permission.message,
            });
        }
        self.ensure_current(generation, node_id).await?;

        let config = match self.shared.configs.get_config(node_id).await {
            Ok(Some(config)) if !config.trim().is_empty() => config,
            Ok(_) => {
                warn!("No configuration for node {}", node_id);
                self.teardown(generation).await;
                return Err(VpnctlError::ConfigUnavailable { node_id });
            }
            Err(e) => {
                self.teardown(generation).await;
                return Err(e);
            }
        };

        let auth = self.shared.credentials.get_node_auth().unwrap_or_default();
        let port = self.shared.settings.management_port;

        let spawned = {
            let _lifecycle = self.shared.lifecycle.lock().await;
            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                return Err(VpnctlError::Cancelled { node_id });
            }

            let spawned = self.shared.supervisor.start(&config, node_id, port);
            if let Ok(daemon) = &spawned {
                state.daemon = Some(daemon.clone());
            }
            spawned
        };
        let daemon = match spawned {
            Ok(daemon) => daemon,
            Err(e) => {
                self.fail_attempt(generation, &e).await;
                return Err(e);
            }
        };

        let early_exit = tokio::select! {
            _ = tokio::time::sleep(self.shared.settings.startup_grace) => None,
            exit = daemon.exited() => Some(exit),
        };
        if let Some(exit) = early_exit {
            if exit.killed || !self.is_current(generation).await {
                return Err(VpnctlError::Cancelled { node_id });
            }
            let err = VpnctlError::ProcessTerminatedDuringHandshake {
                status: exit.describe(),
            };
            self.fail_attempt(generation, &err).await;
            return Err(err);
        }

        let lifecycle = self.shared.lifecycle.lock().await;
        if !self.is_current(generation).await {
            return Err(VpnctlError::Cancelled { node_id });
        }
        if let Some(exit) = daemon.exit_status() {
            drop(lifecycle);
            let err = VpnctlError::ProcessTerminatedDuringHandshake {
                status: exit.describe(),
            };
            self.fail_attempt(generation, &err).await;
            return Err(err);
        }

        let session_events = match self.shared.protocol.connect(port, auth).await {
            Ok(session_events) => session_events,
            Err(e) => {
                drop(lifecycle);
                self.fail_attempt(generation, &e).await;
                return Err(e);
            }
        };

        {
            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                drop(state);
                self.shared.protocol.close().await;
                return Err(VpnctlError::Cancelled { node_id });
            }
            state.node_id = Some(node_id);
        }

        tokio::spawn(self.clone().pump_session(generation, node_id, daemon.clone(), session_events));
        tokio::spawn(self.clone().watch_exit(generation, daemon));
        drop(lifecycle);

        info!("Attached to daemon for node {}", node_id);
        Ok(StartOutcome::Connected {
            message: permission.message,
        })
    }

    /// Tear down the active connection, if any.
    ///
    /// Always re-emits the bandwidth and state resets; `close` only when a
    /// daemon was being supervised.
    pub async fn stop(&self) {
        let generation = self.next_generation().await;
        self.teardown(generation).await;
    }

    async fn next_generation(&self) -> u64 {
        let mut state = self.shared.state.lock().await;
        state.generation += 1;
        state.generation
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.shared.state.lock().await.generation == generation
    }

    async fn ensure_current(&self, generation: u64, node_id: NodeId) -> VpnctlResult<()> {
        if self.is_current(generation).await {
            Ok(())
        } else {
            Err(VpnctlError::Cancelled { node_id })
        }
    }

    async fn fail_attempt(&self, generation: u64, err: &VpnctlError) {
        if self.is_current(generation).await {
            self.shared.events.publish(VpnEvent::Error(err.to_string()));
        }
        self.teardown(generation).await;
    }

    async fn stop_if_current(&self, generation: u64) {
        let next = {
            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.generation
        };
        self.teardown(next).await;
    }

    async fn teardown(&self, generation: u64) {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let daemon = {
            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                debug!("Skipping teardown of superseded attempt");
                return;
            }
            state.node_id = None;
            state.latest_state = None;
            state.latest_bandwidth = None;
            state.daemon.take()
        };

        self.shared.protocol.close().await;

        if let Some(daemon) = &daemon {
            let exit = self.shared.supervisor.kill(daemon).await;
            debug!("Daemon for node {} gone ({})", daemon.node_id(), exit.describe());
            self.shared.events.publish(VpnEvent::Close);
        }
        self.shared.events.publish(VpnEvent::Bandwidth(None));
        self.shared.events.publish(VpnEvent::State(None));
    }

    async fn pump_session(
        self,
        generation: u64,
        node_id: NodeId,
        daemon: DaemonHandle,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::State(report) => {
                    let mut state = self.shared.state.lock().await;
                    if state.generation != generation {
                        return;
                    }
                    let snapshot = report.for_node(node_id);
                    state.latest_state = Some(snapshot.clone());
                    self.shared.events.publish(VpnEvent::State(Some(snapshot)));
                }
                SessionEvent::Bandwidth { bytes_received, bytes_sent } => {
                    let mut state = self.shared.state.lock().await;
                    if state.generation != generation {
                        return;
                    }
                    let sample = BandwidthSample {
                        bytes_received,
                        bytes_sent,
                        node_id,
                    };
                    state.latest_bandwidth = Some(sample);
                    self.shared.events.publish(VpnEvent::Bandwidth(Some(sample)));
                }
                SessionEvent::Failed(err) => {
                    if self.is_current(generation).await {
                        self.shared.events.publish(VpnEvent::Error(VpnctlError::from(err).to_string()));
                        self.stop_if_current(generation).await;
                    }
                    return;
                }
                SessionEvent::Disconnected(reason) => {
                    let settle = self.shared.settings.exit_settle;
                    if tokio::time::timeout(settle, daemon.exited()).await.is_ok() {
                        // Exit watcher owns the teardown
                        return;
                    }
                    if self.is_current(generation).await {
                        let err = VpnctlError::from(ProtocolError::ConnectionReset(reason));
                        self.shared.events.publish(VpnEvent::Error(err.to_string()));
                        self.stop_if_current(generation).await;
                    }
                    return;
                }
            }
        }
    }

    async fn watch_exit(self, generation: u64, daemon: DaemonHandle) {
        let exit = daemon.exited().await;
        if exit.killed || !self.is_current(generation).await {
            return;
        }

        info!("Daemon for node {} exited on its own ({})", daemon.node_id(), exit.describe());
        if !exit.success() {
            self.shared.events.publish(VpnEvent::Error(format!(
                "Daemon for node {} exited unexpectedly ({})",
                daemon.node_id(),
                exit.describe()
            )));
        }
        self.stop_if_current(generation).await;
    }
}
