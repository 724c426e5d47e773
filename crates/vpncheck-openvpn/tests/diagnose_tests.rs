use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use vpncheck_core::{ReportSink, StepStatus};
use vpncheck_openvpn::openvpn::*;

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Calls {
    kills: Vec<PathBuf>,
    launches: Vec<TrialRequest>,
    terminated: usize,
    egress_lookups: usize,
}

#[derive(Clone, Copy)]
enum Script {
    /// Write this log at launch.
    WriteLog(&'static str),
    /// Write this log after a delay, as a forked daemon would.
    WriteLogAfter(&'static str, Duration),
    /// Start but never write a log.
    NoLog,
    /// Refuse to start.
    FailLaunch,
}

struct FakeLauncher {
    script: Script,
    /// Whether the fake client exits right after writing its log.
    exits: bool,
    calls: Arc<Mutex<Calls>>,
}

struct FakeProcess {
    running: bool,
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl TrialProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    async fn terminate(&mut self) -> Result<(), DiagnoseError> {
        self.calls.lock().unwrap().terminated += 1;
        self.running = false;
        Ok(())
    }
}

#[async_trait]
impl TrialLauncher for FakeLauncher {
    async fn client_version(&self) -> Option<String> {
        Some("2.6.8".into())
    }

    async fn kill_matching(&self, config_path: &Path) -> Result<(), DiagnoseError> {
        self.calls.lock().unwrap().kills.push(config_path.to_path_buf());
        Ok(())
    }

    async fn launch(&self, request: &TrialRequest) -> Result<Box<dyn TrialProcess>, DiagnoseError> {
        self.calls.lock().unwrap().launches.push(request.clone());
        match self.script {
            Script::WriteLog(text) => std::fs::write(&request.log_path, text).unwrap(),
            Script::WriteLogAfter(text, delay) => {
                let path = request.log_path.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    std::fs::write(path, text).unwrap();
                });
            }
            Script::NoLog => {}
            Script::FailLaunch => {
                return Err(DiagnoseError::new(
                    DiagnoseErrorKind::ProcessSpawnFailed,
                    "failed to spawn openvpn",
                )
                .with_detail("No such file or directory (os error 2)"))
            }
        }
        Ok(Box::new(FakeProcess {
            running: !self.exits,
            calls: self.calls.clone(),
        }))
    }
}

struct FakeEgress {
    answers: Mutex<VecDeque<Result<String, DiagnoseError>>>,
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl EgressIpLookup for FakeEgress {
    async fn lookup(&self) -> Result<String, DiagnoseError> {
        self.calls.lock().unwrap().egress_lookups += 1;
        self.answers.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(DiagnoseError::new(
                DiagnoseErrorKind::EgressLookupFailed,
                "could not determine public IP",
            ))
        })
    }
}

/// Report writer the test can read back.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

const BODY: &str = "client\ndev tun\nca ca.crt\ncert client.crt\nkey client.key\n";

const SUCCESS_LOG: &str = "Thu Oct 16 10:00:00 2026 OpenVPN 2.6.8 x86_64-pc-linux-gnu\n\
                           Thu Oct 16 10:00:02 2026 TUN/TAP device tun0 opened\n\
                           Thu Oct 16 10:00:03 2026 Initialization Sequence Completed\n";

struct Harness {
    dir: TempDir,
    calls: Arc<Mutex<Calls>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }

    fn settings(&self) -> DiagnoseSettings {
        DiagnoseSettings {
            log_dir: self.dir.path().join("logs"),
            observation_window: Duration::from_millis(1500),
            poll_interval: Some(Duration::from_millis(20)),
            probe_timeout: Duration::from_secs(2),
            ..DiagnoseSettings::default()
        }
    }

    fn write_config(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn runner(
        &self,
        settings: DiagnoseSettings,
        script: Script,
        exits: bool,
        egress: Vec<Result<String, DiagnoseError>>,
    ) -> DiagnosticRunner<FakeLauncher, FakeEgress> {
        DiagnosticRunner::new(
            settings,
            FakeLauncher {
                script,
                exits,
                calls: self.calls.clone(),
            },
            FakeEgress {
                answers: Mutex::new(egress.into()),
                calls: self.calls.clone(),
            },
        )
    }
}

fn step<'a>(outcome: &'a DiagnosisOutcome, name: &str) -> Option<&'a vpncheck_core::DiagnosticStep> {
    outcome.report.steps.iter().find(|s| s.name == name)
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ── Verdicts ────────────────────────────────────────────────────────

#[tokio::test]
async fn success_reports_egress_ip_and_stops_early() {
    let h = Harness::new();
    let config = h.write_config("jp.ovpn", BODY);
    let runner = h.runner(
        h.settings(),
        Script::WriteLog(SUCCESS_LOG),
        false,
        vec![Ok("203.0.113.9".into())],
    );

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::Success);
    assert!(outcome.success);
    assert_eq!(outcome.egress_ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(outcome.client_version.as_deref(), Some("2.6.8"));
    assert!(outcome.report.total_duration_ms < 1500, "wait should stop on the success marker");
    assert!(step(&outcome, "Observation").unwrap().message.contains("success marker seen"));
    assert_eq!(step(&outcome, "Egress IP").unwrap().status, StepStatus::Pass);
    assert!(outcome.report.root_cause_hint.is_none());
}

#[tokio::test]
async fn auth_failed_is_failure_without_egress_lookup() {
    let h = Harness::new();
    let config = h.write_config("auth.ovpn", BODY);
    let runner = h.runner(
        h.settings(),
        Script::WriteLog("AUTH: Received control message: AUTH_FAILED\nSIGTERM received\n"),
        true,
        vec![Ok("203.0.113.9".into())],
    );

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::AuthFailed);
    assert!(!outcome.success);
    assert!(outcome.egress_ip.is_none());
    assert_eq!(h.calls.lock().unwrap().egress_lookups, 0);
    assert!(step(&outcome, "Observation").unwrap().message.contains("window elapsed"));
    assert_eq!(step(&outcome, "Outcome").unwrap().status, StepStatus::Fail);
}

#[tokio::test]
async fn tls_error_only_is_tls_error() {
    let h = Harness::new();
    let config = h.write_config("tls.ovpn", BODY);
    let runner = h.runner(
        h.settings(),
        Script::WriteLog("TLS Error: TLS key negotiation failed to occur within 60 seconds\n"),
        true,
        vec![],
    );

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::TlsError);
    assert!(outcome.report.root_cause_hint.is_some());
    assert!(outcome.report.summary.starts_with("First failure at Outcome"));
}

#[tokio::test]
async fn unknown_shows_log_tail_and_cert_hint() {
    let h = Harness::new();
    let config = h.write_config("cert.ovpn", BODY);
    let log = "line 1\nline 2\nline 3\nline 4\n\
               OpenSSL: error:0480006C:PEM routines::no start line\n\
               Cannot load inline certificate file\n\
               Exiting due to fatal error\n\n";
    let runner = h.runner(h.settings(), Script::WriteLog(log), true, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::Unknown);
    assert!(!outcome.success);
    let detail = step(&outcome, "Outcome").unwrap().detail.clone().unwrap();
    assert_eq!(
        detail,
        "line 3\nline 4\nOpenSSL: error:0480006C:PEM routines::no start line\n\
         Cannot load inline certificate file\nExiting due to fatal error"
    );
    assert!(step(&outcome, "Hint").is_some());
    assert!(outcome.report.root_cause_hint.unwrap().contains("certificate"));
}

#[tokio::test]
async fn launch_failure_is_log_missing_and_skips_wait() {
    let h = Harness::new();
    let config = h.write_config("broken.ovpn", BODY);
    let runner = h.runner(h.settings(), Script::FailLaunch, false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::LogMissing);
    assert!(!outcome.success);
    assert!(step(&outcome, "Observation").is_none());
    assert_eq!(step(&outcome, "Trial launch").unwrap().status, StepStatus::Fail);
    assert!(outcome.report.total_duration_ms < 1500);

    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.terminated, 0);
    assert_eq!(calls.kills, vec![config.clone(), config.clone()]);
}

#[tokio::test]
async fn silent_client_waits_out_window_then_log_missing() {
    let h = Harness::new();
    let config = h.write_config("quiet.ovpn", BODY);
    let settings = DiagnoseSettings {
        observation_window: Duration::from_millis(150),
        ..h.settings()
    };
    let runner = h.runner(settings, Script::NoLog, false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::LogMissing);
    assert!(step(&outcome, "Observation").unwrap().message.contains("window elapsed"));
    assert_eq!(h.calls.lock().unwrap().terminated, 1);
}

#[tokio::test]
async fn fixed_wait_sleeps_full_window() {
    let h = Harness::new();
    let config = h.write_config("fixed.ovpn", BODY);
    let settings = DiagnoseSettings {
        observation_window: Duration::from_millis(200),
        poll_interval: None,
        ..h.settings()
    };
    let runner = h.runner(settings, Script::WriteLog(SUCCESS_LOG), false, vec![Ok("x".into())]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::Success);
    let observation = step(&outcome, "Observation").unwrap();
    assert!(observation.message.contains("window elapsed"));
    assert!(observation.duration_ms >= 200);
}

#[tokio::test]
async fn daemonized_client_keeps_being_observed_after_parent_exits() {
    let h = Harness::new();
    let config = h.write_config("daemon.ovpn", &format!("{BODY}daemon\n"));
    let runner = h.runner(
        h.settings(),
        Script::WriteLogAfter(SUCCESS_LOG, Duration::from_millis(400)),
        true,
        vec![Ok("203.0.113.9".into())],
    );

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::Success);
    let observation = step(&outcome, "Observation").unwrap();
    assert!(observation.message.contains("success marker seen"));
    assert!(observation.duration_ms >= 400);
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Success logs at every path a trial started in the next few seconds
/// could use, as left behind by an earlier fast run.
fn plant_stale_logs(log_dir: &Path) {
    std::fs::create_dir_all(log_dir).unwrap();
    let now = unix_now();
    for ts in now..now + 3 {
        std::fs::write(logging::trial_log_path(log_dir, ts), SUCCESS_LOG).unwrap();
    }
}

#[tokio::test]
async fn launch_failure_ignores_stale_log_from_same_second() {
    let h = Harness::new();
    let config = h.write_config("rerun.ovpn", BODY);
    plant_stale_logs(&h.dir.path().join("logs"));
    let runner = h.runner(h.settings(), Script::FailLaunch, false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::LogMissing);
    assert!(!outcome.success);
}

#[tokio::test]
async fn silent_client_does_not_inherit_stale_log() {
    let h = Harness::new();
    let config = h.write_config("rerun2.ovpn", BODY);
    plant_stale_logs(&h.dir.path().join("logs"));
    let settings = DiagnoseSettings {
        observation_window: Duration::from_millis(100),
        ..h.settings()
    };
    let runner = h.runner(settings, Script::NoLog, false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::LogMissing);
    assert!(!outcome.log_path.exists());
}

// ── Cleanup / fatal paths ───────────────────────────────────────────

#[tokio::test]
async fn cleanup_terminates_and_kills_by_config_path() {
    let h = Harness::new();
    let config = h.write_config("de-1.ovpn", BODY);
    let runner = h.runner(h.settings(), Script::WriteLog(SUCCESS_LOG), false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.terminated, 1);
    assert_eq!(calls.kills, vec![config.clone(), config.clone()]);
    assert_eq!(step(&outcome, "Cleanup").unwrap().status, StepStatus::Pass);
    // Egress failure does not change the verdict.
    assert_eq!(outcome.verdict, Verdict::Success);
    assert_eq!(step(&outcome, "Egress IP").unwrap().status, StepStatus::Warn);
}

#[tokio::test]
async fn trial_request_uses_log_dir_and_fixed_arguments() {
    let h = Harness::new();
    let config = h.write_config("args.ovpn", BODY);
    let runner = h.runner(h.settings(), Script::WriteLog("TLS Error\n"), true, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    let calls = h.calls.lock().unwrap();
    let req = &calls.launches[0];
    assert_eq!(req.config_path, config);
    assert_eq!(req.verbosity, 3);
    assert_eq!(req.connect_timeout_secs, 20);
    assert_eq!(req.log_path, outcome.log_path);
    assert!(req.log_path.starts_with(h.dir.path().join("logs")));
    let name = req.log_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("openvpn_test_") && name.ends_with(".log"));
}

#[tokio::test]
async fn unreadable_config_is_fatal_with_no_actions() {
    let h = Harness::new();
    let runner = h.runner(h.settings(), Script::WriteLog(SUCCESS_LOG), false, vec![]);

    let err = runner
        .run(Path::new("/definitely/missing.ovpn"), &mut ReportSink::silent())
        .await
        .unwrap_err();

    assert_eq!(err.kind, DiagnoseErrorKind::ConfigRead);
    let calls = h.calls.lock().unwrap();
    assert!(calls.launches.is_empty());
    assert!(calls.kills.is_empty());
}

#[tokio::test]
async fn missing_directives_are_listed_but_not_fatal() {
    let h = Harness::new();
    let config = h.write_config("thin.ovpn", "dev tun\nproto udp\n");
    let runner = h.runner(h.settings(), Script::WriteLog(SUCCESS_LOG), false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    let directives = step(&outcome, "Config directives").unwrap();
    assert_eq!(directives.status, StepStatus::Warn);
    assert_eq!(
        directives.message,
        "missing required directives: remote, client, ca, cert, key"
    );
    assert!(outcome.remote.is_none());
    assert!(step(&outcome, "Port probe").is_none());
    assert_eq!(outcome.verdict, Verdict::Success);
}

// ── Probe ───────────────────────────────────────────────────────────

#[tokio::test]
async fn reachable_remote_passes_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let h = Harness::new();
    let config = h.write_config("probe.ovpn", &format!("{BODY}remote 127.0.0.1 {port} tcp\n"));
    let runner = h.runner(h.settings(), Script::WriteLog("TLS Error\n"), true, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(
        outcome.remote,
        Some(RemoteSpec {
            host: "127.0.0.1".into(),
            port: port.to_string()
        })
    );
    assert_eq!(outcome.protocol, VpnProtocol::Tcp);
    assert_eq!(step(&outcome, "Port probe").unwrap().status, StepStatus::Pass);
    assert!(step(&outcome, "Transport").is_none());
}

#[tokio::test]
async fn unreachable_udp_remote_adds_transport_hint() {
    let port = closed_port().await;
    let h = Harness::new();
    let config = h.write_config("udp.ovpn", &format!("{BODY}remote 127.0.0.1 {port}\n"));
    let runner = h.runner(h.settings(), Script::WriteLog("TLS Error\n"), true, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(step(&outcome, "Port probe").unwrap().status, StepStatus::Fail);
    assert_eq!(step(&outcome, "Transport").unwrap().status, StepStatus::Info);
    // The trial still ran.
    assert_eq!(h.calls.lock().unwrap().launches.len(), 1);
}

#[tokio::test]
async fn non_numeric_port_cannot_be_verified() {
    let h = Harness::new();
    let config = h.write_config("badport.ovpn", &format!("{BODY}remote vpn.example.com abc\n"));
    let runner = h.runner(h.settings(), Script::WriteLog("TLS Error\n"), true, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    let probe = step(&outcome, "Port probe").unwrap();
    assert_eq!(probe.status, StepStatus::Warn);
    assert!(probe.message.starts_with("could not verify port"));
}

// ── Egress comparison / report stream ───────────────────────────────

#[tokio::test]
async fn unchanged_egress_ip_warns_without_changing_verdict() {
    let h = Harness::new();
    let config = h.write_config("same.ovpn", BODY);
    let settings = DiagnoseSettings {
        compare_egress_ip: true,
        ..h.settings()
    };
    let runner = h.runner(
        settings,
        Script::WriteLog(SUCCESS_LOG),
        false,
        vec![Ok("198.51.100.1".into()), Ok("198.51.100.1".into())],
    );

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();

    assert_eq!(outcome.verdict, Verdict::Success);
    assert_eq!(step(&outcome, "Baseline IP").unwrap().message, "198.51.100.1");
    let egress = step(&outcome, "Egress IP").unwrap();
    assert_eq!(egress.status, StepStatus::Warn);
    assert!(egress.message.contains("unchanged"));
    assert_eq!(h.calls.lock().unwrap().egress_lookups, 2);
}

#[tokio::test]
async fn report_streams_human_readable_lines() {
    let h = Harness::new();
    let config = h.write_config("stream.ovpn", BODY);
    let runner = h.runner(
        h.settings(),
        Script::WriteLog(SUCCESS_LOG),
        false,
        vec![Ok("203.0.113.9".into())],
    );
    let buf = SharedBuf::default();
    let mut sink = ReportSink::new(Box::new(buf.clone()));

    runner.run(&config, &mut sink).await.unwrap();

    let text = buf.text();
    assert!(text.contains("Diagnosing "));
    assert!(text.contains("[INFO] Client version: OpenVPN 2.6.8"));
    assert!(text.contains("[ OK ] Outcome: tunnel established"));
    assert!(text.contains("[ OK ] Egress IP: 203.0.113.9"));
    assert!(text.contains("Verdict: Success (tunnel established)"));
}

#[tokio::test]
async fn outcome_serializes_to_json() {
    let h = Harness::new();
    let config = h.write_config("json.ovpn", BODY);
    let runner = h.runner(h.settings(), Script::FailLaunch, false, vec![]);

    let outcome = runner.run(&config, &mut ReportSink::silent()).await.unwrap();
    let json = serde_json::to_value(&outcome).unwrap();

    assert_eq!(json["verdict"], "log_missing");
    assert_eq!(json["success"], false);
    assert!(json["report"]["steps"].as_array().unwrap().len() >= 3);
}
