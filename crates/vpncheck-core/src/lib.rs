//! # vpncheck-core
//!
//! Shared diagnostics infrastructure used by the protocol-specific checkers.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **diagnostics** | Step/report types, streaming report sink, TCP reachability probe |

pub mod diagnostics;

pub use diagnostics::{
    finish_report, probe_tcp, DiagnosticReport, DiagnosticStep, ProbeOutcome, ReportSink,
    StepStatus,
};
