//! OpenVPN module root – re-exports public API surface.

pub mod types;
pub mod config;
pub mod process;
pub mod logging;
pub mod egress;
pub mod service;

pub use types::*;
pub use egress::{EgressIpLookup, HttpEgressLookup};
pub use process::{SystemLauncher, TrialLauncher, TrialProcess, TrialRequest};
pub use service::{DiagnosisOutcome, DiagnosticRunner};
