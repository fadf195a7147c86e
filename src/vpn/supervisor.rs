//! OpenVPN daemon process supervision
//!
//! Each daemon runs from a private temporary config file and is held on the
//! management hold until a client attaches. A background task owns the child
//! process, records its exit and performs the TERM/KILL shutdown sequence.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{VpnctlError, VpnctlResult};
use super::common;
use super::management::MANAGEMENT_HOST;
use super::state::NodeId;

/// How a supervised daemon ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonExit {
    /// `None` when the status could not be collected
    pub status: Option<ExitStatus>,
    /// Whether the exit was requested through [`ProcessSupervisor::kill`]
    pub killed: bool,
}

impl DaemonExit {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }

    pub fn describe(&self) -> String {
        match &self.status {
            Some(status) => common::describe_exit(status),
            None => "exit status unavailable".to_string(),
        }
    }
}

struct DaemonInner {
    node_id: NodeId,
    pid: Option<u32>,
    config_path: TempPath,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<DaemonExit>>,
}

/// Shared handle to a running (or finished) daemon.
///
/// The temporary config file lives as long as the last clone of the handle.
#[derive(Clone)]
pub struct DaemonHandle {
    inner: Arc<DaemonInner>,
}

impl DaemonHandle {
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    pub fn is_alive(&self) -> bool {
        self.inner.exit_rx.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<DaemonExit> {
        *self.inner.exit_rx.borrow()
    }

    pub fn was_killed(&self) -> bool {
        self.exit_status().is_some_and(|exit| exit.killed)
    }

    /// Resolves once the process has terminated for any reason
    pub async fn exited(&self) -> DaemonExit {
        let mut exit_rx = self.inner.exit_rx.clone();
        let exit = match exit_rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or(DaemonExit { status: None, killed: false }),
            // Monitor task gone without recording an exit (runtime shutdown)
            Err(_) => DaemonExit { status: None, killed: false },
        };
        exit
    }
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("node_id", &self.inner.node_id)
            .field("pid", &self.inner.pid)
            .field("config_path", &self.config_path())
            .field("exit", &self.exit_status())
            .finish()
    }
}

/// Spawns and stops daemon processes
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: String,
    temp_dir: Option<PathBuf>,
    kill_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, temp_dir: Option<PathBuf>, kill_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            temp_dir,
            kill_timeout,
        }
    }

    /// Command-line arguments for a daemon reading `config_path`
    pub fn daemon_args(config_path: &Path, management_port: u16) -> Vec<String> {
        vec![
            "--config".to_string(),
            config_path.to_string_lossy().to_string(),
            "--management".to_string(),
            MANAGEMENT_HOST.to_string(),
            management_port.to_string(),
            "--management-hold".to_string(),
            "--management-query-passwords".to_string(),
        ]
    }

    /// Write the config to a private temp file and spawn the daemon on it
    pub fn start(
        &self,
        config_contents: &str,
        node_id: NodeId,
        management_port: u16,
    ) -> VpnctlResult<DaemonHandle> {
        let config_path = common::write_secure_config(self.temp_dir.as_deref(), config_contents)?;

        let child = Command::new(&self.program)
            .args(Self::daemon_args(&config_path, management_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VpnctlError::ProcessSpawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        info!(
            "Started {} for node {} (PID: {:?}, management port {})",
            self.program, node_id, pid, management_port
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, kill_rx, exit_tx, self.kill_timeout, node_id));

        Ok(DaemonHandle {
            inner: Arc::new(DaemonInner {
                node_id,
                pid,
                config_path,
                kill_tx: Mutex::new(Some(kill_tx)),
                exit_rx,
            }),
        })
    }

    /// Stop the daemon and wait for it to exit.
    ///
    /// Idempotent; for a process that already exited this only reports how
    /// it ended.
    pub async fn kill(&self, handle: &DaemonHandle) -> DaemonExit {
        if let Some(exit) = handle.exit_status() {
            return exit;
        }

        if let Some(kill_tx) = handle.inner.kill_tx.lock().await.take() {
            debug!("Stopping daemon for node {} (PID: {:?})", handle.node_id(), handle.pid());
            let _ = kill_tx.send(());
        }

        handle.exited().await
    }
}

async fn monitor(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<DaemonExit>>,
    kill_timeout: Duration,
    node_id: NodeId,
) {
    // A dropped sender means every handle is gone; shut the daemon down too
    let exited = tokio::select! {
        result = child.wait() => Some(result),
        _ = &mut kill_rx => None,
    };
    let (result, killed) = match exited {
        Some(result) => (result, false),
        None => (shutdown(&mut child, kill_timeout).await, true),
    };

    let status = match result {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("Error waiting for daemon of node {}: {}", node_id, e);
            None
        }
    };

    let exit = DaemonExit { status, killed };
    if killed {
        info!("Daemon for node {} stopped ({})", node_id, exit.describe());
    } else {
        info!("Daemon for node {} exited ({})", node_id, exit.describe());
    }
    exit_tx.send_replace(Some(exit));
}

async fn shutdown(child: &mut Child, kill_timeout: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Err(e) = common::terminate_process(pid) {
            warn!("Failed to send SIGTERM to {}: {}", pid, e);
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop daemon: {}", e);
    }

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Daemon did not exit within {:?}, sending SIGKILL", kill_timeout);
            child.kill().await?;
            child.wait().await
        }
    }
}
