//! Trial log handling: where the client writes its log, and how the log is
//! turned into a [`Verdict`].
//!
//! Classification is a fixed, ordered rule table. The first rule with any
//! matching pattern wins, so a log containing both the success marker and
//! an earlier `AUTH_FAILED` still classifies as [`Verdict::Success`].

use crate::openvpn::types::*;
use std::path::{Path, PathBuf};

/// Marker the client prints once the tunnel is fully up.
pub const SUCCESS_MARKER: &str = "Initialization Sequence Completed";

/// One classification rule: any of `patterns` → `verdict`.
#[derive(Debug, Clone, Copy)]
pub struct LogRule {
    pub patterns: &'static [&'static str],
    pub verdict: Verdict,
}

impl LogRule {
    pub fn matches(&self, content: &str) -> bool {
        self.patterns.iter().any(|p| content.contains(p))
    }
}

/// Classification rules in priority order.
pub const CLASSIFICATION_RULES: &[LogRule] = &[
    LogRule {
        patterns: &[SUCCESS_MARKER],
        verdict: Verdict::Success,
    },
    LogRule {
        patterns: &["AUTH_FAILED"],
        verdict: Verdict::AuthFailed,
    },
    LogRule {
        patterns: &["TLS Error"],
        verdict: Verdict::TlsError,
    },
    LogRule {
        patterns: &["Connection refused", "No route to host"],
        verdict: Verdict::Unreachable,
    },
];

/// Markers that point at unreadable certificate or key material.
const CERT_LOAD_MARKERS: &[&str] = &["Cannot load", "no start line"];

/// Classify a log's full text. Never returns [`Verdict::LogMissing`].
pub fn classify_log(content: &str) -> Verdict {
    CLASSIFICATION_RULES
        .iter()
        .find(|rule| rule.matches(content))
        .map(|rule| rule.verdict)
        .unwrap_or(Verdict::Unknown)
}

/// Last `n` lines of the log, ignoring surrounding whitespace.
pub fn tail_lines(content: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = content.trim().split('\n').collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

/// Extra operator hint for an unclassified log, if one applies.
pub fn unknown_failure_hint(content: &str) -> Option<&'static str> {
    if CERT_LOAD_MARKERS.iter().any(|m| content.contains(m)) {
        Some("the client could not load a certificate or key; check the ca/cert/key blocks")
    } else {
        None
    }
}

/// `<dir>/openvpn_test_<unix_ts>.log`
pub fn trial_log_path(dir: &Path, unix_ts: i64) -> PathBuf {
    dir.join(format!("openvpn_test_{unix_ts}.log"))
}

/// Log path for a trial starting now.
pub fn new_trial_log_path(dir: &Path) -> PathBuf {
    trial_log_path(dir, chrono::Utc::now().timestamp())
}

/// Create the directory that will hold the trial log and remove any stale
/// log left at the same path by an earlier run in the same second.
pub async fn prepare_log_path(log_path: &Path) -> Result<(), DiagnoseError> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DiagnoseError::new(
                DiagnoseErrorKind::IoError,
                format!("cannot create log directory {}", parent.display()),
            )
            .with_detail(e.to_string())
        })?;
    }
    match tokio::fs::remove_file(log_path).await {
        Ok(()) => {
            tracing::debug!(path = %log_path.display(), "removed stale trial log");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DiagnoseError::new(
            DiagnoseErrorKind::IoError,
            format!("cannot remove stale log {}", log_path.display()),
        )
        .with_detail(e.to_string())),
    }
}

/// Read the trial log if it exists. `Ok(None)` means the client never
/// created it.
pub async fn read_trial_log(path: &Path) -> Result<Option<String>, DiagnoseError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DiagnoseError::new(
            DiagnoseErrorKind::IoError,
            format!("cannot read log file {}", path.display()),
        )
        .with_detail(e.to_string())),
    }
}

/// Whether the log at `path` already shows the success marker.
pub async fn log_shows_success(path: &Path) -> bool {
    matches!(
        read_trial_log(path).await,
        Ok(Some(content)) if content.contains(SUCCESS_MARKER)
    )
}
