//! Trial process lifecycle: launch the OpenVPN client against a config,
//! watch whether it is still alive, terminate it, and sweep up strays.
//!
//! The runner only talks to the [`TrialLauncher`] / [`TrialProcess`]
//! traits, so tests can swap in a fake that writes a synthetic log instead
//! of starting a privileged client.

use crate::openvpn::types::*;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Request / arguments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to start one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRequest {
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub verbosity: u8,
    pub connect_timeout_secs: u16,
}

/// Client arguments for a trial.
pub fn build_args(req: &TrialRequest) -> Vec<String> {
    vec![
        "--config".into(),
        req.config_path.to_string_lossy().into_owned(),
        "--verb".into(),
        req.verbosity.to_string(),
        "--connect-timeout".into(),
        req.connect_timeout_secs.to_string(),
        "--log".into(),
        req.log_path.to_string_lossy().into_owned(),
    ]
}

/// `pgrep -f` pattern matching client processes launched for `config_path`.
///
/// The pattern is anchored to the `--config <path>` arguments a trial is
/// started with, so a process that merely mentions the config (an editor,
/// this tool) does not match. The bracketed first letter keeps it from
/// matching the command line that carries the pattern.
pub fn kill_pattern(config_path: &Path) -> String {
    format!(
        "[o]penvpn .*--config {}( |$)",
        escape_ere(&config_path.to_string_lossy())
    )
}

/// Pids listed in `pgrep` output, excluding `own_pid`.
pub fn parse_pids(output: &str, own_pid: u32) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|tok| tok.parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
        .collect()
}

/// Escape POSIX extended-regex metacharacters.
fn escape_ere(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if r".[]()*+?{}|^$\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Capability traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A running (or finished) trial client.
#[async_trait]
pub trait TrialProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// `false` once the process has exited.
    fn is_running(&mut self) -> bool;

    /// Ask the process to stop gracefully.
    async fn terminate(&mut self) -> Result<(), DiagnoseError>;
}

/// Starts trial clients and kills stray ones.
#[async_trait]
pub trait TrialLauncher: Send + Sync {
    /// Version of the client binary, if it can be determined.
    async fn client_version(&self) -> Option<String> {
        None
    }

    /// Best-effort kill of every client process started for `config_path`.
    async fn kill_matching(&self, config_path: &Path) -> Result<(), DiagnoseError>;

    /// Start the client. Does not wait for it to connect or exit.
    async fn launch(&self, request: &TrialRequest) -> Result<Box<dyn TrialProcess>, DiagnoseError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  System implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How long `terminate` waits for the client to exit after SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Launches the real OpenVPN binary, optionally through a privilege wrapper.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    pub openvpn_binary: PathBuf,
    pub elevate_with: Option<String>,
    pub pgrep_binary: String,
}

impl SystemLauncher {
    pub fn from_settings(settings: &DiagnoseSettings) -> Self {
        Self {
            openvpn_binary: settings.openvpn_binary.clone(),
            elevate_with: settings.elevate_with.clone(),
            pgrep_binary: settings.pgrep_binary.clone(),
        }
    }
}

fn elevated(elevate_with: Option<&str>, program: impl AsRef<OsStr>) -> Command {
    match elevate_with {
        Some(wrapper) => {
            let mut cmd = Command::new(wrapper);
            cmd.arg(program);
            cmd
        }
        None => Command::new(program),
    }
}

#[async_trait]
impl TrialLauncher for SystemLauncher {
    async fn client_version(&self) -> Option<String> {
        let output = Command::new(&self.openvpn_binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_version_string(&combined)
    }

    async fn kill_matching(&self, config_path: &Path) -> Result<(), DiagnoseError> {
        let pattern = kill_pattern(config_path);
        // pgrep exits 1 when nothing matched; only a failure to run counts.
        let output = Command::new(&self.pgrep_binary)
            .arg("-f")
            .arg(&pattern)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DiagnoseError::new(
                    DiagnoseErrorKind::ProcessSignalFailed,
                    format!("failed to run {}", self.pgrep_binary),
                )
                .with_detail(e.to_string())
            })?;

        let pids = parse_pids(&String::from_utf8_lossy(&output.stdout), std::process::id());
        tracing::debug!(%pattern, ?pids, "killing stray trial processes");
        if pids.is_empty() {
            return Ok(());
        }

        let status = elevated(self.elevate_with.as_deref(), "kill")
            .arg("-TERM")
            .args(pids.iter().map(u32::to_string))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                DiagnoseError::new(DiagnoseErrorKind::ProcessSignalFailed, "failed to run kill")
                    .with_detail(e.to_string())
            })?;
        if !status.success() {
            // A listed process may have exited in between.
            tracing::debug!(%status, "kill -TERM reported failure");
        }
        Ok(())
    }

    async fn launch(&self, request: &TrialRequest) -> Result<Box<dyn TrialProcess>, DiagnoseError> {
        let args = build_args(request);
        tracing::info!(binary = %self.openvpn_binary.display(), ?args, "launching trial client");
        let child = elevated(self.elevate_with.as_deref(), &self.openvpn_binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DiagnoseError::new(
                    DiagnoseErrorKind::ProcessSpawnFailed,
                    format!("failed to spawn {}", self.openvpn_binary.display()),
                )
                .with_detail(e.to_string())
            })?;
        Ok(Box::new(SystemTrialProcess {
            child,
            elevate_with: self.elevate_with.clone(),
        }))
    }
}

/// A spawned client. Dropping it kills the child.
pub struct SystemTrialProcess {
    child: Child,
    elevate_with: Option<String>,
}

#[async_trait]
impl TrialProcess for SystemTrialProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<(), DiagnoseError> {
        if !self.is_running() {
            return Ok(());
        }
        let Some(pid) = self.pid() else {
            return Ok(());
        };

        let signalled = match elevated(self.elevate_with.as_deref(), "kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(s) if s.success() => true,
            Ok(s) => {
                tracing::warn!(pid, status = %s, "kill -TERM failed");
                false
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "could not run kill");
                false
            }
        };

        if signalled
            && tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
                .await
                .is_ok()
        {
            return Ok(());
        }
        if !self.is_running() {
            return Ok(());
        }

        tracing::warn!(pid, "trial client still running, killing");
        self.child.start_kill().map_err(|e| {
            DiagnoseError::new(
                DiagnoseErrorKind::ProcessSignalFailed,
                format!("failed to kill pid {pid}"),
            )
            .with_detail(e.to_string())
        })?;
        let _ = tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await;

        if self.is_running() {
            Err(DiagnoseError::new(
                DiagnoseErrorKind::ProcessSignalFailed,
                format!("pid {pid} did not exit"),
            ))
        } else {
            Ok(())
        }
    }
}
