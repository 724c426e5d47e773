//! Shared diagnostics infrastructure.
//!
//! Provides the step/report types every checker records its findings into,
//! a [`ReportSink`] that prints each finding the moment it is recorded, and
//! the TCP reachability probe used before a tunnel trial.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

// ─── Shared types ───────────────────────────────────────────────────────────

/// Outcome class of a single diagnostic step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pass,
    Fail,
    Warn,
    Info,
    Skip,
}

impl StepStatus {
    /// Fixed-width tag used in the human-readable report.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Pass => "[ OK ]",
            Self::Fail => "[FAIL]",
            Self::Warn => "[WARN]",
            Self::Info => "[INFO]",
            Self::Skip => "[SKIP]",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Result of a single diagnostic probe step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticStep {
    pub name: String,
    pub status: StepStatus,
    pub message: String,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

impl DiagnosticStep {
    pub fn new(name: impl Into<String>, status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            duration_ms: 0,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Stamp the step with the time elapsed since `started`.
    pub fn timed(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }

    /// Render the step as report lines. Detail lines are indented under the
    /// message so multi-line excerpts stay readable.
    pub fn render(&self) -> String {
        let mut out = format!("  {} {}: {}\n", self.status.tag(), self.name, self.message);
        if let Some(detail) = &self.detail {
            for line in detail.lines() {
                out.push_str("         ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

/// Full diagnostic report for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    /// What was diagnosed (e.g. the configuration path).
    pub subject: String,
    pub steps: Vec<DiagnosticStep>,
    pub summary: String,
    pub root_cause_hint: Option<String>,
    /// Wall-clock milliseconds for the entire diagnostic run.
    pub total_duration_ms: u64,
}

impl DiagnosticReport {
    pub fn failed_steps(&self) -> impl Iterator<Item = &DiagnosticStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Fail)
    }
}

/// Build the final report from accumulated steps.
pub fn finish_report(
    subject: &str,
    steps: Vec<DiagnosticStep>,
    root_cause_hint: Option<String>,
    start: Instant,
) -> DiagnosticReport {
    let all_pass = steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Pass | StepStatus::Info | StepStatus::Skip));
    let first_fail = steps.iter().find(|s| s.status == StepStatus::Fail);
    let any_warn = steps.iter().any(|s| s.status == StepStatus::Warn);

    let summary = if all_pass {
        "All diagnostic steps passed.".to_string()
    } else if let Some(fail) = first_fail {
        format!("First failure at {}: {}", fail.name, fail.message)
    } else if any_warn {
        "Completed with warnings.".to_string()
    } else {
        "Completed with mixed results.".to_string()
    };

    DiagnosticReport {
        subject: subject.to_string(),
        steps,
        summary,
        root_cause_hint,
        total_duration_ms: start.elapsed().as_millis() as u64,
    }
}

// ─── Streaming sink ─────────────────────────────────────────────────────────

/// Collects steps and prints each one as soon as it is recorded.
pub struct ReportSink {
    out: Box<dyn Write + Send>,
    steps: Vec<DiagnosticStep>,
}

impl ReportSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            steps: Vec::new(),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// A sink that keeps the steps but prints nothing.
    pub fn silent() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// Print a free-form heading line (not recorded as a step).
    pub fn heading(&mut self, text: &str) {
        self.emit(&format!("\n{text}\n"));
    }

    pub fn record(&mut self, step: DiagnosticStep) {
        tracing::debug!(step = %step.name, status = %step.status, "{}", step.message);
        let rendered = step.render();
        self.emit(&rendered);
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[DiagnosticStep] {
        &self.steps
    }

    pub fn take_steps(&mut self) -> Vec<DiagnosticStep> {
        std::mem::take(&mut self.steps)
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            tracing::warn!("failed to write report output: {e}");
        }
    }
}

// ─── Reachability probe ─────────────────────────────────────────────────────

/// Result of a TCP reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProbeOutcome {
    /// The connect succeeded; the socket was closed right after.
    Reachable { addr: SocketAddr, elapsed_ms: u64 },
    /// Resolution worked but the connect failed or timed out.
    Unreachable { addr: SocketAddr, reason: String },
    /// Reachability could not be verified at all (resolution failure).
    Error { reason: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable { .. })
    }

    /// Convert the outcome into a report step for `host:port`.
    pub fn to_step(&self, port_label: &str) -> DiagnosticStep {
        match self {
            Self::Reachable { addr, elapsed_ms } => DiagnosticStep::new(
                "Port probe",
                StepStatus::Pass,
                format!("port {port_label} is reachable ({addr} in {elapsed_ms}ms)"),
            ),
            Self::Unreachable { addr, reason } => DiagnosticStep::new(
                "Port probe",
                StepStatus::Fail,
                format!("port {port_label} is not reachable ({addr})"),
            )
            .with_detail(reason.clone()),
            Self::Error { reason } => DiagnosticStep::new(
                "Port probe",
                StepStatus::Warn,
                format!("could not verify port {port_label}"),
            )
            .with_detail(reason.clone()),
        }
    }
}

/// Attempt a TCP connect to `host:port` with a timeout.
///
/// The first resolved IPv4 address is preferred; the stream is dropped as
/// soon as the connect completes.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    let resolved = match tokio::time::timeout(timeout, tokio::net::lookup_host((host, port))).await
    {
        Ok(Ok(addrs)) => addrs.collect::<Vec<SocketAddr>>(),
        Ok(Err(e)) => {
            return ProbeOutcome::Error {
                reason: format!("DNS lookup for {host} failed: {e}"),
            }
        }
        Err(_) => {
            return ProbeOutcome::Error {
                reason: format!("DNS lookup for {host} timed out"),
            }
        }
    };

    let Some(addr) = resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
    else {
        return ProbeOutcome::Error {
            reason: format!("DNS returned no addresses for {host}"),
        };
    };

    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeOutcome::Reachable {
                addr,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        }
        Ok(Err(e)) => {
            let hint = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                "connection refused: the service may not be running or listens on another port"
            } else {
                "check firewall rules and that the server is running"
            };
            ProbeOutcome::Unreachable {
                addr,
                reason: format!("{e} ({hint})"),
            }
        }
        Err(_) => ProbeOutcome::Unreachable {
            addr,
            reason: format!(
                "connect timed out after {}s: the port may be firewalled or the host is down",
                timeout.as_secs()
            ),
        },
    }
}
