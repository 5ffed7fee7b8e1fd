//! Egress listener - routes result frames back to their waiting callers.
//!
//! One task per outbound connection reads the frames the next hop sends back,
//! decodes each one and resolves the matching correlation entry. When the
//! stream ends or errors, every entry still pending on that route is failed so
//! no ingress call is left waiting on a connection that is gone.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{Stream, StreamExt};

use crate::bridge::codec::{Frame, FrameCodec};
use crate::correlation::{CorrelationTable, RouteId};
use crate::error::RelayError;

/// Counters reported when the listener exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EgressStats {
    /// Frames that fulfilled a pending entry.
    pub resolved: usize,
    /// Frames whose id was recovered but whose body was bad; the entry was failed.
    pub failed: usize,
    /// Frames with no recoverable id, or for an id nobody is waiting on.
    pub dropped: usize,
}

/// Run until `frames` ends. Fails the route's remaining entries on exit.
pub async fn run_egress<S>(
    mut frames: S,
    codec: FrameCodec,
    table: Arc<CorrelationTable>,
    route: RouteId,
) -> EgressStats
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let mut stats = EgressStats::default();
    tracing::debug!(route, "Egress listener started");

    let exit_error = loop {
        match frames.next().await {
            Some(Ok(raw)) => handle_frame(&codec, &table, &raw, &mut stats),
            Some(Err(e)) => {
                tracing::error!(route, error = %e, "Egress stream failed");
                break RelayError::Transport(e.to_string());
            }
            None => {
                tracing::info!(route, "Next hop closed the connection");
                break RelayError::ConnectionClosed;
            }
        }
    };

    table.fail_route(route, exit_error);
    tracing::debug!(
        route,
        resolved = stats.resolved,
        failed = stats.failed,
        dropped = stats.dropped,
        "Egress listener stopped"
    );
    stats
}

fn handle_frame(codec: &FrameCodec, table: &CorrelationTable, raw: &[u8], stats: &mut EgressStats) {
    match codec.decode(raw) {
        Ok(Frame { id, payload }) => match table.resolve(id, Ok(payload)) {
            Ok(()) => stats.resolved += 1,
            Err(e) => {
                // Late (after timeout) or duplicate delivery. Nobody is waiting.
                tracing::warn!(request_id = %id, error = %e, "Ignoring result frame");
                stats.dropped += 1;
            }
        },
        Err(e) => match e.request_id() {
            Some(id) => {
                tracing::warn!(request_id = %id, error = %e, "Bad result frame, failing request");
                match table.resolve(id, Err(RelayError::Frame(e.to_string()))) {
                    Ok(()) => stats.failed += 1,
                    Err(_) => stats.dropped += 1,
                }
            }
            None => {
                tracing::error!(error = %e, frame_bytes = raw.len(), "Dropping undecodable frame");
                stats.dropped += 1;
            }
        },
    }
}
