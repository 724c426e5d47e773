//! Command-line surface of `vpncheck`.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use vpncheck_openvpn::openvpn::DiagnoseSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vpncheck")]
#[command(about = "Check whether an OpenVPN client configuration can establish a tunnel", long_about = None)]
#[command(version)]
pub struct Cli {
    /// OpenVPN client configuration to diagnose
    pub config: PathBuf,

    /// OpenVPN client binary
    #[arg(long, env = "VPNCHECK_OPENVPN", value_name = "PATH")]
    pub openvpn: Option<PathBuf>,

    /// Directory for trial logs [default: logs/ next to the executable]
    #[arg(long, env = "VPNCHECK_LOG_DIR", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Run the client and kill commands without sudo
    #[arg(long, env = "VPNCHECK_NO_SUDO")]
    pub no_sudo: bool,

    /// Observation window after launching the client, in seconds
    #[arg(
        long,
        env = "VPNCHECK_WINDOW",
        value_name = "SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub window: u64,

    /// Sleep for the whole window instead of polling the log
    #[arg(long)]
    pub fixed_wait: bool,

    /// Look up the public IP before the trial and warn if it did not change
    #[arg(long)]
    pub compare_ip: bool,

    /// Also write the full outcome as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub report_json: Option<PathBuf>,

    /// Debug-level operational logging on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Format of operational logging on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Fold the flags over the default settings.
    pub fn to_settings(&self) -> DiagnoseSettings {
        let mut settings = DiagnoseSettings::default();
        if let Some(binary) = &self.openvpn {
            settings.openvpn_binary = binary.clone();
        }
        if let Some(dir) = &self.log_dir {
            settings.log_dir = dir.clone();
        }
        if self.no_sudo {
            settings.elevate_with = None;
        }
        settings.observation_window = Duration::from_secs(self.window);
        if self.fixed_wait {
            settings.poll_interval = None;
        }
        settings.compare_egress_ip = self.compare_ip;
        settings
    }

    /// Default tracing filter when `VPNCHECK_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "warn"
        }
    }
}
