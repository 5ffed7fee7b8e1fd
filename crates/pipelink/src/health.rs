//! Health status types for pipeline nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::version::VersionInfo;

/// What a node reports about itself on `/healthcheck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Configured next hop (`None` on the tail node).
    pub forward_address: Option<String>,
    /// Whether the outbound connection is established and alive.
    pub connected: bool,
    /// Requests waiting for a result on this node.
    #[serde(default)]
    pub pending: usize,
    #[serde(default)]
    pub version: VersionInfo,
}

/// Outcome of one peer call in a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerOutcome {
    pub status: PeerStatus,
    /// Peer's response body (JSON or text) or the error that prevented one.
    pub response: serde_json::Value,
}

impl PeerOutcome {
    pub fn ok(response: serde_json::Value) -> Self {
        Self {
            status: PeerStatus::Ok,
            response,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PeerStatus::Failed,
            response: serde_json::Value::String(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PeerStatus::Ok
    }
}

/// Per-peer results of a fan-out, keyed by peer address.
pub type FanOutReport = BTreeMap<String, PeerOutcome>;

/// True when at least one peer in the report failed.
pub fn is_degraded(report: &FanOutReport) -> bool {
    report.values().any(|outcome| !outcome.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_status_serializes_lowercase() {
        insta::assert_json_snapshot!([PeerStatus::Ok, PeerStatus::Failed], @r#"
        [
          "ok",
          "failed"
        ]
        "#);
    }

    #[test]
    fn failed_outcome_carries_error_text() {
        let outcome = PeerOutcome::failed("connection refused");
        insta::assert_json_snapshot!(outcome, @r#"
        {
          "status": "failed",
          "response": "connection refused"
        }
        "#);
    }

    #[test]
    fn degraded_when_any_peer_failed() {
        let mut report = FanOutReport::new();
        report.insert("http://a".to_string(), PeerOutcome::ok(serde_json::json!({})));
        assert!(!is_degraded(&report));

        report.insert("http://b".to_string(), PeerOutcome::failed("down"));
        assert!(is_degraded(&report));
    }

    #[test]
    fn node_status_roundtrips_and_tolerates_minimal_peers() {
        let status = NodeStatus {
            forward_address: Some("10.0.0.2:5001".to_string()),
            connected: true,
            pending: 2,
            version: VersionInfo::new(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["forward_address"], "10.0.0.2:5001");
        assert_eq!(json["connected"], true);

        // Older peers may only report the two required fields.
        let minimal: NodeStatus =
            serde_json::from_str(r#"{"forward_address": null, "connected": false}"#).unwrap();
        assert_eq!(minimal.forward_address, None);
        assert!(!minimal.connected);
        assert_eq!(minimal.pending, 0);
    }
}
