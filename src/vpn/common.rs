use crate::error::{VpnctlError, VpnctlResult};
use std::io::Write;
use std::path::Path;
use std::process::ExitStatus;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::debug;

/// Helpers shared by the daemon supervisor and the binary

/// Check if a binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    match Command::new("which").arg(binary).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Write daemon configuration to a fresh, uniquely named file readable only
/// by the owner. The file is removed when the returned path is dropped.
pub fn write_secure_config(dir: Option<&Path>, contents: &str) -> VpnctlResult<TempPath> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("vpnctl-").suffix(".ovpn");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o600));
    }

    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| VpnctlError::ConfigError(format!("Failed to create daemon config file: {}", e)))?;

    file.write_all(contents.as_bytes())?;
    file.flush()?;

    let path = file.into_temp_path();
    debug!("Wrote daemon config to {:?}", path);
    Ok(path)
}

/// Ask a process to terminate with SIGTERM
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Human-readable exit status, including the terminating signal on unix
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }

    "unknown exit status".to_string()
}
