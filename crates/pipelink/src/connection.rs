//! Connection manager - owns the single outbound connection to the next hop.
//!
//! Flow:
//! 1. `connect` closes any previous connection (failing what it carried)
//! 2. Dial the next hop and split the stream
//! 3. Spawn the egress listener on the read half
//! 4. Publish the write half for senders
//!
//! Sends are serialized by a mutex around the framed writer. Each connection
//! gets a fresh route id so the correlation table can fail exactly the
//! requests that were in flight on it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use futures::SinkExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::bridge::codec::FrameCodec;
use crate::bridge::transport::{FrameWriter, dial};
use crate::correlation::{CorrelationTable, RouteId};
use crate::egress::{EgressStats, run_egress};
use crate::error::RelayError;

/// One established connection to the next hop.
pub struct Outbound {
    route: RouteId,
    peer: String,
    writer: Mutex<FrameWriter>,
    alive: Arc<AtomicBool>,
    egress: StdMutex<Option<JoinHandle<EgressStats>>>,
}

impl Outbound {
    pub fn route(&self) -> RouteId {
        self.route
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// False once the egress listener has seen the stream end or a write failed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write one already-encoded frame.
    pub async fn send(&self, frame: Bytes) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(|e| {
            self.alive.store(false, Ordering::Release);
            tracing::error!(peer = %self.peer, route = self.route, error = %e, "Frame write failed");
            RelayError::Transport(e.to_string())
        })
    }

    /// Shut the write half, stop the egress listener and fail what was pending.
    async fn close(&self, table: &CorrelationTable) {
        self.alive.store(false, Ordering::Release);

        if let Err(e) = SinkExt::<Bytes>::close(&mut *self.writer.lock().await).await {
            tracing::debug!(peer = %self.peer, error = %e, "Error closing outbound writer");
        }

        let egress = match self.egress.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = egress {
            handle.abort();
        }

        table.fail_route(self.route, RelayError::ConnectionClosed);
        tracing::info!(peer = %self.peer, route = self.route, "Closed outbound connection");
    }
}

/// Owner of the outbound connection slot.
pub struct ConnectionManager {
    codec: FrameCodec,
    table: Arc<CorrelationTable>,
    current: RwLock<Option<Arc<Outbound>>>,
    /// Serializes connect/close so replacement is close-then-replace.
    lifecycle: Mutex<()>,
    next_route: AtomicU64,
}

impl ConnectionManager {
    pub fn new(codec: FrameCodec, table: Arc<CorrelationTable>) -> Self {
        Self {
            codec,
            table,
            current: RwLock::new(None),
            lifecycle: Mutex::new(()),
            next_route: AtomicU64::new(1),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Replace the outbound connection with a fresh one to `addr`.
    ///
    /// The previous connection is torn down first, even if dialing fails; in
    /// that case the node is left unconnected.
    pub async fn connect(&self, addr: &str) -> Result<(), RelayError> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = self.current.write().await.take();
        if let Some(previous) = previous {
            previous.close(&self.table).await;
        }

        let (reader, writer) = dial(addr, &self.codec).await.map_err(|e| {
            tracing::error!(peer = %addr, error = %e, "Failed to connect to next hop");
            RelayError::Transport(format!("failed to connect to {addr}: {e}"))
        })?;

        let route = self.next_route.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));

        let egress = {
            let table = Arc::clone(&self.table);
            let alive = Arc::clone(&alive);
            let codec = self.codec;
            let peer = addr.to_string();
            tokio::spawn(async move {
                let stats = run_egress(reader, codec, Arc::clone(&table), route).await;
                alive.store(false, Ordering::Release);
                // Catch requests registered between the egress sweep and the flag flip.
                table.fail_route(route, RelayError::ConnectionClosed);
                tracing::warn!(%peer, route, "Outbound connection lost");
                stats
            })
        };

        *self.current.write().await = Some(Arc::new(Outbound {
            route,
            peer: addr.to_string(),
            writer: Mutex::new(writer),
            alive,
            egress: StdMutex::new(Some(egress)),
        }));

        tracing::info!(peer = %addr, route, "Connected to next hop");
        Ok(())
    }

    /// Current connection, if one is established.
    pub async fn current(&self) -> Option<Arc<Outbound>> {
        self.current.read().await.clone()
    }

    /// Live connection or `NotConnected`.
    pub async fn require(&self) -> Result<Arc<Outbound>, RelayError> {
        match self.current().await {
            Some(outbound) if outbound.is_alive() => Ok(outbound),
            Some(_) => Err(RelayError::ConnectionClosed),
            None => Err(RelayError::NotConnected),
        }
    }

    /// Write a frame to the current connection.
    pub async fn send(&self, frame: Bytes) -> Result<RouteId, RelayError> {
        let outbound = self.require().await?;
        outbound.send(frame).await?;
        Ok(outbound.route())
    }

    /// True when a connection exists and has not been observed broken.
    pub async fn is_connected(&self) -> bool {
        self.current()
            .await
            .map(|outbound| outbound.is_alive())
            .unwrap_or(false)
    }

    /// Close the connection, if any. Used on shutdown.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.current.write().await.take();
        if let Some(previous) = previous {
            previous.close(&self.table).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RequestId;
    use crate::bridge::transport::{bind, split_framed};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Next hop that sends every frame straight back.
    async fn spawn_echo_hop() -> (String, JoinHandle<()>) {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(echo_loop(listener));
        (addr, handle)
    }

    async fn echo_loop(listener: TcpListener) {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) =
                    split_framed(stream, &FrameCodec::default()).unwrap();
                while let Some(Ok(raw)) = reader.next().await {
                    if writer.send(raw.freeze()).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn manager() -> (ConnectionManager, Arc<CorrelationTable>) {
        let table = CorrelationTable::new();
        (
            ConnectionManager::new(FrameCodec::default(), Arc::clone(&table)),
            table,
        )
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let (manager, _) = manager();
        assert!(!manager.is_connected().await);
        assert_eq!(
            manager.send(Bytes::from_static(b"x")).await.unwrap_err(),
            RelayError::NotConnected
        );
    }

    #[tokio::test]
    async fn connect_then_roundtrip_through_echo() {
        let (addr, _hop) = spawn_echo_hop().await;
        let (manager, table) = manager();

        manager.connect(&addr).await.unwrap();
        assert!(manager.is_connected().await);

        let outbound = manager.require().await.unwrap();
        assert_eq!(outbound.peer(), addr);

        let id = RequestId::new();
        let pending = table.register(id, outbound.route()).unwrap();
        let frame = manager.codec().encode(id, b"payload").unwrap();
        manager.send(frame).await.unwrap();

        let result = pending.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn connect_to_unreachable_leaves_node_unconnected() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (manager, _) = manager();
        assert!(matches!(
            manager.connect(&addr).await,
            Err(RelayError::Transport(_))
        ));
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn reconnect_closes_previous_and_fails_its_requests() {
        // A hop that accepts but never answers.
        let silent = bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap().to_string();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        });
        let (echo_addr, _echo) = spawn_echo_hop().await;

        let (manager, table) = manager();
        manager.connect(&silent_addr).await.unwrap();
        let first_route = manager.require().await.unwrap().route();

        let stranded = table.register(RequestId::new(), first_route).unwrap();

        manager.connect(&echo_addr).await.unwrap();
        let second = manager.require().await.unwrap();
        assert_ne!(second.route(), first_route);
        assert_eq!(second.peer(), echo_addr);

        assert_eq!(
            stranded.wait(Some(Duration::from_secs(5))).await.unwrap_err(),
            RelayError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn hop_disconnect_marks_connection_dead() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (hang_up_tx, hang_up_rx) = tokio::sync::oneshot::channel::<()>();
        // Accept one connection and drop it once told to.
        let hop = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = hang_up_rx.await;
            drop(stream);
        });

        let (manager, table) = manager();
        manager.connect(&addr).await.unwrap();
        let route = manager.require().await.unwrap().route();
        let pending = table.register(RequestId::new(), route).unwrap();
        hang_up_tx.send(()).unwrap();
        hop.await.unwrap();

        assert_eq!(
            pending.wait(Some(Duration::from_secs(5))).await.unwrap_err(),
            RelayError::ConnectionClosed
        );

        // The liveness flag flips right after the listener exits.
        for _ in 0..100 {
            if !manager.is_connected().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.is_connected().await);
        assert_eq!(
            manager.send(Bytes::from_static(b"x")).await.unwrap_err(),
            RelayError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn close_clears_slot_and_fails_pending() {
        let (addr, _hop) = spawn_echo_hop().await;
        let (manager, table) = manager();
        manager.connect(&addr).await.unwrap();
        let outbound = manager.require().await.unwrap();
        let pending = table.register(RequestId::new(), outbound.route()).unwrap();

        manager.close().await;
        assert!(manager.current().await.is_none());
        assert!(!manager.is_connected().await);
        assert!(!outbound.is_alive());
        assert_eq!(
            pending.wait(Some(Duration::from_secs(5))).await.unwrap_err(),
            RelayError::ConnectionClosed
        );
        assert_eq!(
            outbound.send(Bytes::from_static(b"x")).await.unwrap_err(),
            RelayError::ConnectionClosed
        );
    }
}
