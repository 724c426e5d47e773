//! # vpncheck-openvpn
//!
//! Diagnoses a single OpenVPN client configuration by trying it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Verdict, endpoint, settings, and the error type |
//! | **config** | Required-directive scan, `remote` extraction, transport detection |
//! | **process** | Trial client lifecycle – launch, liveness, terminate, stray kill |
//! | **logging** | Trial log paths, reading, and verdict classification |
//! | **egress** | Public IP lookup through IP-echo services |
//! | **service** | Runner orchestrating the checks into a streamed report |

pub mod openvpn;
