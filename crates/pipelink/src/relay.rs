//! Inbound frame listener.
//!
//! Accepts connections from the previous hop. Every frame is handled on its
//! own task so a slow request never blocks the ones behind it; replies on a
//! connection share one writer behind a mutex.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};

use crate::bridge::transport::{FrameWriter, split_framed};
use crate::service::NodeService;

/// Accept upstream connections until shutdown is signalled.
pub async fn serve_frames(listener: TcpListener, service: Arc<NodeService>) {
    let mut shutdown_rx = service.shutdown_rx();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Frame listener ready");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_upstream(stream, peer, Arc::clone(&service)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept upstream connection");
                }
            },
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
        }
    }

    tracing::info!("Frame listener stopped");
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn handle_upstream(stream: TcpStream, peer: SocketAddr, service: Arc<NodeService>) {
    let (mut reader, writer) = match split_framed(stream, service.codec()) {
        Ok(halves) => halves,
        Err(e) => {
            tracing::error!(%peer, error = %e, "Failed to set up upstream connection");
            return;
        }
    };
    let writer = Arc::new(Mutex::new(writer));
    tracing::info!(%peer, "Upstream connected");

    while let Some(next) = reader.next().await {
        match next {
            Ok(raw) => {
                tokio::spawn(relay_frame(
                    raw.freeze(),
                    Arc::clone(&service),
                    Arc::clone(&writer),
                ));
            }
            Err(e) => {
                tracing::error!(%peer, error = %e, "Upstream read failed");
                break;
            }
        }
    }

    tracing::info!(%peer, "Upstream disconnected");
}

async fn relay_frame(raw: Bytes, service: Arc<NodeService>, writer: Arc<Mutex<FrameWriter>>) {
    let frame = match service.codec().decode(&raw) {
        Ok(frame) => frame,
        Err(e) => {
            match e.request_id() {
                Some(id) => tracing::warn!(request_id = %id, error = %e, "Dropping bad inbound frame"),
                None => tracing::error!(error = %e, "Dropping undecodable inbound frame"),
            }
            return;
        }
    };
    let id = frame.id;

    let result = match service.relay(id, frame.payload).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(request_id = %id, error = %e, "Relay failed, no reply sent upstream");
            return;
        }
    };

    let reply = match service.codec().encode(id, &result) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(request_id = %id, error = %e, "Failed to encode reply");
            return;
        }
    };

    let mut writer = writer.lock().await;
    if let Err(e) = writer.send(reply).await {
        tracing::warn!(request_id = %id, error = %e, "Failed to send reply upstream");
    } else {
        tracing::trace!(request_id = %id, "Reply sent upstream");
    }
}
