//! Diagnostic runner: drives one configuration through static checks, a
//! reachability probe, a tunnel trial, log classification, and cleanup.
//!
//! Findings are streamed into a [`ReportSink`] as they are discovered; the
//! returned [`DiagnosisOutcome`] carries the same steps plus the verdict.

use crate::openvpn::config;
use crate::openvpn::egress::{EgressIpLookup, HttpEgressLookup};
use crate::openvpn::logging;
use crate::openvpn::process::{SystemLauncher, TrialLauncher, TrialProcess, TrialRequest};
use crate::openvpn::types::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use vpncheck_core::{finish_report, probe_tcp, DiagnosticReport, DiagnosticStep, ReportSink, StepStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one run found out about a configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisOutcome {
    pub verdict: Verdict,
    pub success: bool,
    pub remote: Option<RemoteSpec>,
    pub protocol: VpnProtocol,
    pub log_path: PathBuf,
    pub client_version: Option<String>,
    pub egress_ip: Option<String>,
    pub report: DiagnosticReport,
}

/// Why the observation window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    SuccessLogged,
    WindowElapsed,
}

impl WaitEnd {
    fn describe(&self) -> &'static str {
        match self {
            Self::SuccessLogged => "success marker seen",
            Self::WindowElapsed => "window elapsed",
        }
    }
}

const LOG_MISSING_HINT: &str =
    "the client did not start or could not write its log; check the binary path and privileges";

/// Failed step carrying an error's message and detail.
fn error_step(name: &str, e: &DiagnoseError) -> DiagnosticStep {
    let step = DiagnosticStep::new(name, StepStatus::Fail, e.message.clone());
    match &e.detail {
        Some(detail) => step.with_detail(detail.clone()),
        None => step,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DiagnosticRunner<L, E> {
    settings: DiagnoseSettings,
    launcher: L,
    egress: E,
}

impl DiagnosticRunner<SystemLauncher, HttpEgressLookup> {
    /// Runner backed by the real client binary and HTTP IP-echo services.
    pub fn system(settings: DiagnoseSettings) -> Result<Self, DiagnoseError> {
        let launcher = SystemLauncher::from_settings(&settings);
        let egress = HttpEgressLookup::from_settings(&settings)?;
        Ok(Self::new(settings, launcher, egress))
    }
}

impl<L: TrialLauncher, E: EgressIpLookup> DiagnosticRunner<L, E> {
    pub fn new(settings: DiagnoseSettings, launcher: L, egress: E) -> Self {
        Self {
            settings,
            launcher,
            egress,
        }
    }

    pub fn settings(&self) -> &DiagnoseSettings {
        &self.settings
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Diagnose one configuration file.
    ///
    /// Only an unreadable configuration is an error; every other problem is
    /// a finding in the report and a non-success verdict.
    pub async fn run(
        &self,
        config_path: &Path,
        sink: &mut ReportSink,
    ) -> Result<DiagnosisOutcome, DiagnoseError> {
        let started = Instant::now();
        let subject = config_path.display().to_string();
        sink.heading(&format!("Diagnosing {subject}"));

        // ── Step A: static checks ────────────────────────────
        let t = Instant::now();
        let content = match config::read_config(config_path).await {
            Ok(c) => c,
            Err(e) => {
                sink.record(error_step("Config file", &e).timed(t));
                return Err(e);
            }
        };
        let missing = config::missing_directives(&content);
        sink.record(if missing.is_empty() {
            DiagnosticStep::new(
                "Config directives",
                StepStatus::Pass,
                "all required directives present",
            )
        } else {
            DiagnosticStep::new(
                "Config directives",
                StepStatus::Warn,
                format!("missing required directives: {}", missing.join(", ")),
            )
        });

        // ── Step B: endpoint + probe ─────────────────────────
        let remote = config::extract_remote(&content);
        let protocol = config::detect_protocol(&content);
        match &remote {
            Some(remote) => self.probe_remote(remote, protocol, sink).await,
            None => tracing::debug!("no remote line, skipping probe"),
        }

        // ── Step C: trial ────────────────────────────────────
        let client_version = self.launcher.client_version().await;
        if let Some(version) = &client_version {
            sink.record(DiagnosticStep::new(
                "Client version",
                StepStatus::Info,
                format!("OpenVPN {version}"),
            ));
        }

        if let Err(e) = self.launcher.kill_matching(config_path).await {
            tracing::debug!(error = %e, "pre-launch kill failed");
        }

        let baseline_ip = if self.settings.compare_egress_ip {
            self.baseline_ip(sink).await
        } else {
            None
        };

        let log_path = logging::new_trial_log_path(&self.settings.log_dir);
        let mut trial = self.launch(config_path, &log_path, sink).await;

        if let Some(process) = trial.as_mut() {
            let t = Instant::now();
            let end = self.observe(process.as_mut(), &log_path).await;
            sink.record(
                DiagnosticStep::new(
                    "Observation",
                    StepStatus::Info,
                    format!(
                        "waited {:.1}s ({})",
                        t.elapsed().as_secs_f64(),
                        end.describe()
                    ),
                )
                .timed(t),
            );
        }

        // ── Step D: classification ───────────────────────────
        // Without a launched client any file at the log path is not ours.
        let (verdict, root_cause_hint, egress_ip) = if trial.is_some() {
            self.classify(&log_path, baseline_ip.as_deref(), sink).await
        } else {
            sink.record(
                DiagnosticStep::new("Outcome", StepStatus::Fail, Verdict::LogMissing.describe())
                    .with_detail(log_path.display().to_string()),
            );
            (Verdict::LogMissing, Some(LOG_MISSING_HINT.to_string()), None)
        };

        // ── Step E: cleanup ──────────────────────────────────
        self.cleanup(trial, config_path, sink).await;

        let report = finish_report(&subject, sink.steps().to_vec(), root_cause_hint, started);
        sink.heading(&format!("Verdict: {verdict} ({})", verdict.describe()));
        tracing::info!(%verdict, duration_ms = report.total_duration_ms, "diagnosis finished");

        Ok(DiagnosisOutcome {
            verdict,
            success: verdict.is_success(),
            remote,
            protocol,
            log_path,
            client_version,
            egress_ip,
            report,
        })
    }

    async fn probe_remote(&self, remote: &RemoteSpec, protocol: VpnProtocol, sink: &mut ReportSink) {
        sink.record(DiagnosticStep::new(
            "Remote endpoint",
            StepStatus::Info,
            format!("{remote} ({protocol})"),
        ));

        let port = match remote.port_number() {
            Ok(p) => p,
            Err(e) => {
                sink.record(
                    DiagnosticStep::new(
                        "Port probe",
                        StepStatus::Warn,
                        format!("could not verify port {}", remote.port),
                    )
                    .with_detail(e.to_string()),
                );
                return;
            }
        };

        let t = Instant::now();
        let outcome = probe_tcp(&remote.host, port, self.settings.probe_timeout).await;
        sink.record(outcome.to_step(&remote.port).timed(t));

        if !outcome.is_reachable() && protocol == VpnProtocol::Udp {
            sink.record(DiagnosticStep::new(
                "Transport",
                StepStatus::Info,
                "the server uses UDP; a TCP probe cannot confirm it is down",
            ));
        }
    }

    async fn baseline_ip(&self, sink: &mut ReportSink) -> Option<String> {
        let t = Instant::now();
        match self.egress.lookup().await {
            Ok(ip) => {
                sink.record(
                    DiagnosticStep::new("Baseline IP", StepStatus::Info, ip.clone()).timed(t),
                );
                Some(ip)
            }
            Err(e) => {
                sink.record(
                    DiagnosticStep::new(
                        "Baseline IP",
                        StepStatus::Warn,
                        "could not determine public IP before the trial",
                    )
                    .with_detail(e.to_string())
                    .timed(t),
                );
                None
            }
        }
    }

    /// Prepare the log path and start the client. A failure is reported and
    /// yields `None`, which skips the observation window.
    async fn launch(
        &self,
        config_path: &Path,
        log_path: &Path,
        sink: &mut ReportSink,
    ) -> Option<Box<dyn TrialProcess>> {
        let t = Instant::now();
        if let Err(e) = logging::prepare_log_path(log_path).await {
            sink.record(error_step("Trial launch", &e).timed(t));
            return None;
        }

        let request = TrialRequest {
            config_path: config_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            verbosity: self.settings.verbosity,
            connect_timeout_secs: self.settings.connect_timeout_secs,
        };
        match self.launcher.launch(&request).await {
            Ok(process) => {
                let pid = process
                    .pid()
                    .map(|p| format!("pid {p}"))
                    .unwrap_or_else(|| "pid unknown".into());
                sink.record(
                    DiagnosticStep::new(
                        "Trial launch",
                        StepStatus::Info,
                        format!("client started ({pid})"),
                    )
                    .with_detail(format!("log: {}", log_path.display()))
                    .timed(t),
                );
                Some(process)
            }
            Err(e) => {
                tracing::warn!(error = %e, "trial launch failed");
                sink.record(error_step("Trial launch", &e).timed(t));
                None
            }
        }
    }

    /// Wait for the trial to settle, bounded by the observation window.
    ///
    /// Only the success marker ends the wait early. The launched process
    /// exiting does not: with `daemon` the client forks and the parent exits
    /// while the daemon keeps writing the log.
    async fn observe(&self, process: &mut dyn TrialProcess, log_path: &Path) -> WaitEnd {
        let window = self.settings.observation_window;
        let Some(interval) = self.settings.poll_interval else {
            tokio::time::sleep(window).await;
            return WaitEnd::WindowElapsed;
        };

        let deadline = tokio::time::Instant::now() + window;
        loop {
            if logging::log_shows_success(log_path).await {
                return WaitEnd::SuccessLogged;
            }
            if !process.is_running() {
                tracing::trace!(pid = ?process.pid(), "launched process no longer running");
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return WaitEnd::WindowElapsed;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Classify the trial log and report the findings for the verdict.
    async fn classify(
        &self,
        log_path: &Path,
        baseline_ip: Option<&str>,
        sink: &mut ReportSink,
    ) -> (Verdict, Option<String>, Option<String>) {
        let content = match logging::read_trial_log(log_path).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                sink.record(
                    DiagnosticStep::new(
                        "Outcome",
                        StepStatus::Fail,
                        Verdict::LogMissing.describe(),
                    )
                    .with_detail(log_path.display().to_string()),
                );
                return (Verdict::LogMissing, Some(LOG_MISSING_HINT.to_string()), None);
            }
            Err(e) => {
                sink.record(
                    DiagnosticStep::new("Outcome", StepStatus::Fail, "log file could not be read")
                        .with_detail(e.to_string()),
                );
                return (Verdict::LogMissing, None, None);
            }
        };

        let verdict = logging::classify_log(&content);
        let mut egress_ip = None;
        let hint: Option<String> = match verdict {
            Verdict::Success => {
                sink.record(DiagnosticStep::new(
                    "Outcome",
                    StepStatus::Pass,
                    verdict.describe(),
                ));
                egress_ip = self.report_egress_ip(baseline_ip, sink).await;
                None
            }
            Verdict::AuthFailed => {
                sink.record(DiagnosticStep::new("Outcome", StepStatus::Fail, verdict.describe()));
                Some("the server rejected the credentials or client certificate".into())
            }
            Verdict::TlsError => {
                sink.record(DiagnosticStep::new("Outcome", StepStatus::Fail, verdict.describe()));
                Some("check the ca/cert/key material and any tls-auth or tls-crypt key".into())
            }
            Verdict::Unreachable => {
                sink.record(DiagnosticStep::new("Outcome", StepStatus::Fail, verdict.describe()));
                Some("the server refused the connection or no route to it exists".into())
            }
            Verdict::Unknown | Verdict::LogMissing => {
                let tail = logging::tail_lines(&content, self.settings.tail_lines).join("\n");
                sink.record(
                    DiagnosticStep::new("Outcome", StepStatus::Fail, verdict.describe())
                        .with_detail(tail),
                );
                let hint = logging::unknown_failure_hint(&content);
                if let Some(h) = hint {
                    sink.record(DiagnosticStep::new("Hint", StepStatus::Info, h));
                }
                hint.map(str::to_string)
            }
        };
        (verdict, hint, egress_ip)
    }

    /// Look up the egress IP while the tunnel is up. Never changes the verdict.
    async fn report_egress_ip(&self, baseline_ip: Option<&str>, sink: &mut ReportSink) -> Option<String> {
        let t = Instant::now();
        match self.egress.lookup().await {
            Ok(ip) => {
                let step = match baseline_ip {
                    Some(before) if before == ip => DiagnosticStep::new(
                        "Egress IP",
                        StepStatus::Warn,
                        format!("public IP unchanged ({ip}); traffic may not use the tunnel"),
                    ),
                    Some(before) => DiagnosticStep::new(
                        "Egress IP",
                        StepStatus::Pass,
                        format!("{ip} (was {before})"),
                    ),
                    None => DiagnosticStep::new("Egress IP", StepStatus::Pass, ip.clone()),
                };
                sink.record(step.timed(t));
                Some(ip)
            }
            Err(e) => {
                sink.record(
                    DiagnosticStep::new("Egress IP", StepStatus::Warn, "could not determine public IP")
                        .with_detail(e.to_string())
                        .timed(t),
                );
                None
            }
        }
    }

    /// Stop the trial client, then sweep any stray client for this config.
    async fn cleanup(&self, trial: Option<Box<dyn TrialProcess>>, config_path: &Path, sink: &mut ReportSink) {
        let t = Instant::now();
        let mut problems = Vec::new();

        if let Some(mut process) = trial {
            if let Err(e) = process.terminate().await {
                problems.push(e.to_string());
            }
        }
        if let Err(e) = self.launcher.kill_matching(config_path).await {
            problems.push(e.to_string());
        }

        let step = if problems.is_empty() {
            DiagnosticStep::new("Cleanup", StepStatus::Pass, "trial client stopped")
        } else {
            DiagnosticStep::new("Cleanup", StepStatus::Warn, "cleanup was incomplete")
                .with_detail(problems.join("\n"))
        };
        sink.record(step.timed(t));
    }
}
