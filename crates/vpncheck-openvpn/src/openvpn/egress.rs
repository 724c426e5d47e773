//! Public egress-IP lookup through plain-text IP-echo services.

use crate::openvpn::types::*;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Reports the address the outside world sees for this host.
#[async_trait]
pub trait EgressIpLookup: Send + Sync {
    async fn lookup(&self) -> Result<String, DiagnoseError>;
}

/// Queries each configured IP-echo URL in order until one answers.
pub struct HttpEgressLookup {
    client: Client,
    urls: Vec<String>,
}

impl HttpEgressLookup {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self, DiagnoseError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DiagnoseError::new(
                DiagnoseErrorKind::EgressLookupFailed,
                "failed to create HTTP client",
            )
            .with_detail(e.to_string())
        })?;
        Ok(Self { client, urls })
    }

    pub fn from_settings(settings: &DiagnoseSettings) -> Result<Self, DiagnoseError> {
        Self::new(settings.egress_urls.clone(), settings.egress_timeout)
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let body = resp.text().await.map_err(|e| e.to_string())?;
        let ip = body.trim();
        if ip.is_empty() {
            return Err("empty response".into());
        }
        Ok(ip.to_string())
    }
}

#[async_trait]
impl EgressIpLookup for HttpEgressLookup {
    async fn lookup(&self) -> Result<String, DiagnoseError> {
        let mut failures = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            match self.fetch(url).await {
                Ok(ip) => return Ok(ip),
                Err(reason) => {
                    tracing::debug!(%url, %reason, "egress lookup failed");
                    failures.push(format!("{url}: {reason}"));
                }
            }
        }
        let err = DiagnoseError::new(
            DiagnoseErrorKind::EgressLookupFailed,
            "could not determine public IP",
        );
        Err(if failures.is_empty() {
            err.with_detail("no IP-echo service configured")
        } else {
            err.with_detail(failures.join("; "))
        })
    }
}
