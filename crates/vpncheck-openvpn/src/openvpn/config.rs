//! Static checks over raw `.ovpn` text: required directives, the first
//! `remote` endpoint, and the transport in use.
//!
//! Nothing here parses the configuration structurally; the checks are the
//! same substring and prefix tests an operator would do by eye.

use crate::openvpn::types::*;
use std::path::Path;

/// Directives a client configuration must mention.
pub const REQUIRED_DIRECTIVES: [&str; 5] = ["remote", "client", "ca", "cert", "key"];

/// Read the whole configuration file. Invalid UTF-8 is replaced, not fatal.
pub async fn read_config(path: &Path) -> Result<String, DiagnoseError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        DiagnoseError::new(
            DiagnoseErrorKind::ConfigRead,
            format!("cannot read {}", path.display()),
        )
        .with_detail(e.to_string())
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Required directives whose name does not occur anywhere in `content`.
pub fn missing_directives(content: &str) -> Vec<&'static str> {
    REQUIRED_DIRECTIVES
        .iter()
        .copied()
        .filter(|d| !content.contains(d))
        .collect()
}

/// Lines that start exactly with `remote ` (no leading whitespace).
fn remote_lines(content: &str) -> impl Iterator<Item = &str> {
    content.split('\n').filter(|l| l.starts_with("remote "))
}

/// Endpoint of the first `remote` line; the port defaults to 1194.
///
/// Returns `None` when there is no `remote` line or it carries no host.
pub fn extract_remote(content: &str) -> Option<RemoteSpec> {
    let line = remote_lines(content).next()?;
    let mut tokens = line.split_whitespace().skip(1);
    let host = tokens.next()?;
    let port = tokens.next().unwrap_or(DEFAULT_PORT);
    Some(RemoteSpec {
        host: host.to_string(),
        port: port.to_string(),
    })
}

/// Transport of the first remote: its 4th token, else the first `proto`
/// directive, else OpenVPN's UDP default.
pub fn detect_protocol(content: &str) -> VpnProtocol {
    if let Some(proto) = remote_lines(content)
        .next()
        .and_then(|l| l.split_whitespace().nth(3))
    {
        return VpnProtocol::from_str_loose(proto);
    }
    content
        .lines()
        .map(str::trim)
        .find_map(|l| {
            let mut parts = l.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("proto"), Some(p)) => Some(VpnProtocol::from_str_loose(p)),
                _ => None,
            }
        })
        .unwrap_or_default()
}
