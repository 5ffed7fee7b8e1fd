//! Peer fan-out over HTTP.
//!
//! `/activate` and `/workerhealthcheck` call every configured peer
//! concurrently. Each call is isolated: an unreachable peer becomes a
//! `failed` entry in the report and never aborts the others.

use std::time::Duration;

use futures::future::join_all;

use crate::health::{FanOutReport, PeerOutcome};
use crate::version::PIPELINK_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("peer answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("peer returned invalid JSON: {0}")]
    Body(String),
}

/// HTTP client for control calls to other pipeline nodes.
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("pipelink/{}", PIPELINK_VERSION))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Probe `/healthcheck` on every peer.
    pub async fn aggregate_status(&self, peers: &[String]) -> FanOutReport {
        let calls = peers.iter().map(|peer| async move {
            let outcome = match self.get_json(&endpoint(peer, "healthcheck")).await {
                Ok(status) => PeerOutcome::ok(status),
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Peer healthcheck failed");
                    PeerOutcome::failed(e.to_string())
                }
            };
            (peer.clone(), outcome)
        });
        let report: FanOutReport = join_all(calls).await.into_iter().collect();
        log_report("healthcheck", &report);
        report
    }

    /// Ask every peer to connect to its own next hop via `/connect`.
    pub async fn activate(&self, peers: &[String]) -> FanOutReport {
        let calls = peers.iter().map(|peer| async move {
            let outcome = match self.get_text(&endpoint(peer, "connect")).await {
                Ok(text) => PeerOutcome::ok(serde_json::Value::String(text)),
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Peer activation failed");
                    PeerOutcome::failed(e.to_string())
                }
            };
            (peer.clone(), outcome)
        });
        let report: FanOutReport = join_all(calls).await.into_iter().collect();
        log_report("activate", &report);
        report
    }

    async fn get_text(&self, url: &str) -> Result<String, PeerError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PeerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, PeerError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| PeerError::Body(e.to_string()))
    }
}

fn endpoint(peer: &str, path: &str) -> String {
    format!("{}/{}", peer.trim_end_matches('/'), path)
}

fn log_report(operation: &str, report: &FanOutReport) {
    let failed = report.values().filter(|o| !o.is_ok()).count();
    if failed > 0 {
        tracing::warn!(operation, peers = report.len(), failed, "Fan-out partially failed");
    } else {
        tracing::info!(operation, peers = report.len(), "Fan-out complete");
    }
}
