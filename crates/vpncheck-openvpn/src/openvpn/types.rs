//! Shared types, enums, settings, and the error type for the OpenVPN checker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Verdict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classified outcome of one diagnostic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The client reported `Initialization Sequence Completed`.
    Success,
    AuthFailed,
    TlsError,
    /// The server refused the connection or no route exists.
    Unreachable,
    /// A log was written but matched no known marker.
    Unknown,
    /// The client never produced a log file.
    LogMissing,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Operator-facing description used in the report.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Success => "tunnel established",
            Self::AuthFailed => "authentication failed",
            Self::TlsError => "TLS handshake error",
            Self::Unreachable => "server unreachable",
            Self::Unknown => "unknown failure (inspect the log)",
            Self::LogMissing => "log file was not created",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::AuthFailed => write!(f, "AuthFailed"),
            Self::TlsError => write!(f, "TlsError"),
            Self::Unreachable => write!(f, "Unreachable"),
            Self::Unknown => write!(f, "Unknown"),
            Self::LogMissing => write!(f, "LogMissing"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Remote endpoint / transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OpenVPN's port when a `remote` line omits one.
pub const DEFAULT_PORT: &str = "1194";

/// Transport protocol of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    Udp,
    Tcp,
}

impl Default for VpnProtocol {
    fn default() -> Self {
        Self::Udp
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl VpnProtocol {
    /// Parse from an OpenVPN `proto` value (`tcp-client`, `udp6`, ...).
    pub fn from_str_loose(s: &str) -> Self {
        if s.to_lowercase().starts_with("tcp") {
            Self::Tcp
        } else {
            Self::Udp
        }
    }
}

/// Endpoint taken from the first `remote` line of a configuration.
///
/// The port is kept as the raw token; it is only converted to a number when
/// the endpoint is probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub host: String,
    pub port: String,
}

impl RemoteSpec {
    pub fn port_number(&self) -> Result<u16, DiagnoseError> {
        self.port.parse::<u16>().map_err(|e| {
            DiagnoseError::new(
                DiagnoseErrorKind::ParseError,
                format!("invalid port '{}'", self.port),
            )
            .with_detail(e.to_string())
        })
    }
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every tunable of a diagnostic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseSettings {
    // ── External tools ───────────────────────────────────────
    /// OpenVPN client executable.
    pub openvpn_binary: PathBuf,
    /// Privilege wrapper prepended to the client and kill commands.
    pub elevate_with: Option<String>,
    /// Utility used to find stray clients by command-line pattern.
    pub pgrep_binary: String,

    // ── Trial ────────────────────────────────────────────────
    /// Directory that receives `openvpn_test_<ts>.log` files.
    pub log_dir: PathBuf,
    pub verbosity: u8,
    /// Value passed to `--connect-timeout`, in seconds.
    pub connect_timeout_secs: u16,
    /// Upper bound of the wait after launching the client.
    pub observation_window: Duration,
    /// `None` sleeps for the full window without looking at the log.
    pub poll_interval: Option<Duration>,

    // ── Probes ───────────────────────────────────────────────
    pub probe_timeout: Duration,
    pub egress_timeout: Duration,
    /// IP-echo services, tried in order.
    pub egress_urls: Vec<String>,
    /// Capture the egress IP before the trial and warn if it did not change.
    pub compare_egress_ip: bool,

    // ── Report ───────────────────────────────────────────────
    /// Log lines shown for an unclassified failure.
    pub tail_lines: usize,
}

impl Default for DiagnoseSettings {
    fn default() -> Self {
        Self {
            openvpn_binary: find_openvpn_binary().unwrap_or_else(|| PathBuf::from("openvpn")),
            elevate_with: Some("sudo".into()),
            pgrep_binary: "pgrep".into(),
            log_dir: default_log_dir(),
            verbosity: 3,
            connect_timeout_secs: 20,
            observation_window: Duration::from_secs(15),
            poll_interval: Some(Duration::from_millis(500)),
            probe_timeout: Duration::from_secs(5),
            egress_timeout: Duration::from_secs(5),
            egress_urls: vec![
                "https://api.ipify.org".into(),
                "https://icanhazip.com".into(),
            ],
            compare_egress_ip: false,
            tail_lines: 5,
        }
    }
}

/// `logs/` next to the running executable, or `./logs` when that is unknown.
pub fn default_log_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crate-level error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnoseErrorKind {
    ConfigRead,
    ProcessSpawnFailed,
    ProcessSignalFailed,
    EgressLookupFailed,
    IoError,
    ParseError,
}

/// Crate-level error.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind:?}] {message}{}", fmt_detail(.detail))]
pub struct DiagnoseError {
    pub kind: DiagnoseErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

fn fmt_detail(detail: &Option<String>) -> String {
    detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default()
}

impl DiagnoseError {
    pub fn new(kind: DiagnoseErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Binary location helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known OpenVPN binary paths by platform.
pub fn default_binary_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\Program Files\OpenVPN\bin\openvpn.exe"));
        paths.push(PathBuf::from(r"C:\Program Files (x86)\OpenVPN\bin\openvpn.exe"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
        paths.push(PathBuf::from("/opt/homebrew/sbin/openvpn"));
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        paths.push(PathBuf::from("/usr/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/bin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
    }
    paths
}

/// Try to find the openvpn binary on the system.
pub fn find_openvpn_binary() -> Option<PathBuf> {
    default_binary_paths()
        .into_iter()
        .find(|p| p.exists())
        .or_else(|| which::which("openvpn").ok())
}

/// Parse an OpenVPN `--version` output line (e.g. "OpenVPN 2.6.8 …").
pub fn parse_version_string(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"OpenVPN\s+(\d+\.\d+(?:\.\d+)?)").ok()?;
    re.captures(output).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_serde_roundtrip() {
        let json = serde_json::to_string(&Verdict::AuthFailed).unwrap();
        assert_eq!(json, "\"auth_failed\"");
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Verdict::AuthFailed);
    }

    #[test]
    fn only_success_is_success() {
        assert!(Verdict::Success.is_success());
        for v in [
            Verdict::AuthFailed,
            Verdict::TlsError,
            Verdict::Unreachable,
            Verdict::Unknown,
            Verdict::LogMissing,
        ] {
            assert!(!v.is_success(), "{v} must count as failure");
        }
    }

    #[test]
    fn protocol_from_str_loose() {
        assert_eq!(VpnProtocol::from_str_loose("tcp-client"), VpnProtocol::Tcp);
        assert_eq!(VpnProtocol::from_str_loose("TCP4"), VpnProtocol::Tcp);
        assert_eq!(VpnProtocol::from_str_loose("udp6"), VpnProtocol::Udp);
        assert_eq!(VpnProtocol::from_str_loose("bogus"), VpnProtocol::Udp);
    }

    #[test]
    fn remote_port_number() {
        let r = RemoteSpec {
            host: "10.0.0.5".into(),
            port: "443".into(),
        };
        assert_eq!(r.port_number().unwrap(), 443);
        assert_eq!(r.to_string(), "10.0.0.5:443");
    }

    #[test]
    fn remote_port_number_rejects_garbage() {
        let r = RemoteSpec {
            host: "h".into(),
            port: "udp".into(),
        };
        let err = r.port_number().unwrap_err();
        assert_eq!(err.kind, DiagnoseErrorKind::ParseError);
        assert!(err.message.contains("'udp'"));
    }

    #[test]
    fn settings_defaults() {
        let s = DiagnoseSettings::default();
        assert_eq!(s.verbosity, 3);
        assert_eq!(s.connect_timeout_secs, 20);
        assert_eq!(s.observation_window, Duration::from_secs(15));
        assert_eq!(s.probe_timeout, Duration::from_secs(5));
        assert_eq!(s.egress_timeout, Duration::from_secs(5));
        assert_eq!(s.tail_lines, 5);
        assert_eq!(s.elevate_with.as_deref(), Some("sudo"));
        assert_eq!(s.egress_urls[0], "https://api.ipify.org");
        assert!(s.log_dir.ends_with("logs"));
    }

    #[test]
    fn error_display() {
        let e = DiagnoseError::new(DiagnoseErrorKind::ConfigRead, "cannot read client.ovpn");
        assert_eq!(e.to_string(), "[ConfigRead] cannot read client.ovpn");
        let e = e.with_detail("No such file or directory");
        assert_eq!(
            e.to_string(),
            "[ConfigRead] cannot read client.ovpn (No such file or directory)"
        );
    }

    #[test]
    fn default_binary_paths_not_empty() {
        assert!(!default_binary_paths().is_empty());
    }

    #[test]
    fn parse_version_string_valid() {
        let output = "OpenVPN 2.6.8 x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] [LZ4]";
        assert_eq!(parse_version_string(output), Some("2.6.8".into()));
    }

    #[test]
    fn parse_version_string_invalid() {
        assert_eq!(parse_version_string("no version here"), None);
    }
}
