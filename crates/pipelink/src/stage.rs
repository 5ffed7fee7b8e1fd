//! Compute stage seam.
//!
//! The router never looks inside a tensor beyond the ingress shape check. What
//! a node does to a payload before passing it on belongs to whatever implements
//! [`Stage`].

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StageError(pub String);

/// Per-node compute step applied to every relayed payload.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn process(&self, payload: Bytes) -> Result<Bytes, StageError>;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;
}

/// Returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl Stage for Passthrough {
    async fn process(&self, payload: Bytes) -> Result<Bytes, StageError> {
        Ok(payload)
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}
