//! Router-wide error type.

use crate::bridge::protocol::RequestId;

/// Errors surfaced to an ingress caller or to the node operator.
///
/// `Clone` because a single transport failure fans out to every request
/// pending on the broken route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Payload rejected before any network interaction.
    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("No outbound connection (call /connect first)")]
    NotConnected,

    #[error("No forward address configured")]
    NoForwardAddress,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection to next hop closed")]
    ConnectionClosed,

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Request {0} already pending")]
    DuplicateRequest(RequestId),

    #[error("No such pending request: {0}")]
    NoSuchRequest(RequestId),

    #[error("Timed out waiting for result")]
    Timeout,

    /// The waiting side went away before a result arrived.
    #[error("Request abandoned")]
    Abandoned,

    #[error("Stage failed: {0}")]
    Stage(String),
}

impl RelayError {
    /// True for errors the caller caused (HTTP 400), false for server-side failures.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::BadInput(_))
    }
}
