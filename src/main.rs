mod cli;

use clap::Parser;
use cli::{Cli, LogFormat};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vpncheck_core::ReportSink;
use vpncheck_openvpn::openvpn::{DiagnoseError, DiagnoseErrorKind, DiagnosisOutcome, DiagnosticRunner};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not failures.
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    init_tracing(&cli);

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "diagnosis aborted");
            eprintln!("vpncheck: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_env("VPNCHECK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: &Cli) -> Result<bool, DiagnoseError> {
    let settings = cli.to_settings();
    tracing::debug!(?settings, "effective settings");

    let runner = DiagnosticRunner::system(settings)?;
    let mut sink = ReportSink::stdout();
    let outcome = runner.run(&cli.config, &mut sink).await?;

    if let Some(path) = &cli.report_json {
        write_report(path, &outcome)?;
    }
    Ok(outcome.success)
}

fn write_report(path: &Path, outcome: &DiagnosisOutcome) -> Result<(), DiagnoseError> {
    let json = serde_json::to_string_pretty(outcome).map_err(|e| {
        DiagnoseError::new(DiagnoseErrorKind::IoError, "cannot serialize report")
            .with_detail(e.to_string())
    })?;
    std::fs::write(path, json).map_err(|e| {
        DiagnoseError::new(
            DiagnoseErrorKind::IoError,
            format!("cannot write {}", path.display()),
        )
        .with_detail(e.to_string())
    })
}
