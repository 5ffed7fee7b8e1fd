//! NodeService: transport-agnostic request routing for one pipeline node.
//!
//! This service owns:
//! - The correlation table (pending requests on this node)
//! - The connection manager (single outbound connection to the next hop)
//! - The compute stage applied to relayed frames
//! - Shutdown coordination
//!
//! The HTTP routes and the frame listener both delegate here.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::RequestId;
use crate::config::NodeConfig;
use crate::connection::ConnectionManager;
use crate::correlation::CorrelationTable;
use crate::error::RelayError;
use crate::health::{FanOutReport, NodeStatus};
use crate::peers::{PeerClient, PeerError};
use crate::stage::Stage;
use crate::tensor::{self, InputShape};
use crate::version::VersionInfo;

pub struct NodeService {
    forward: Option<String>,
    slices: Vec<String>,
    input_shape: InputShape,
    request_timeout: Option<Duration>,

    table: Arc<CorrelationTable>,
    connections: ConnectionManager,
    peers: PeerClient,
    stage: Arc<dyn Stage>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    version: VersionInfo,
}

impl NodeService {
    pub fn new(config: &NodeConfig, stage: Arc<dyn Stage>) -> Result<Self, PeerError> {
        let table = CorrelationTable::new();
        let codec = FrameCodec::new(config.compression_level, config.max_frame_bytes);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            forward: config.forward.clone(),
            slices: config.slices.clone(),
            input_shape: config.input_shape.clone(),
            request_timeout: config.request_timeout,
            connections: ConnectionManager::new(codec, Arc::clone(&table)),
            table,
            peers: PeerClient::new(config.probe_timeout)?,
            version: VersionInfo::new().with_stage(stage.name()),
            stage,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn codec(&self) -> &FrameCodec {
        self.connections.codec()
    }

    pub fn forward_address(&self) -> Option<&str> {
        self.forward.as_deref()
    }

    pub fn slices(&self) -> &[String] {
        &self.slices
    }

    /// Ingress: validate, assign a fresh id, forward, and wait for the result.
    pub async fn submit(&self, payload: Bytes) -> Result<Bytes, RelayError> {
        let header = tensor::inspect(&payload).map_err(|e| RelayError::BadInput(e.to_string()))?;
        if !self.input_shape.accepts(&header) {
            return Err(RelayError::BadInput(format!(
                "expected trailing dimensions {}, got shape {}",
                self.input_shape,
                InputShape::new(header.shape.clone())
            )));
        }

        let id = RequestId::new();
        tracing::debug!(request_id = %id, shape = ?header.shape, "Accepted input");
        self.forward(id, payload).await
    }

    /// Send `payload` downstream under `id` and wait for the matching result.
    pub async fn forward(&self, id: RequestId, payload: Bytes) -> Result<Bytes, RelayError> {
        let outbound = self.connections.require().await?;
        let pending = self.table.register(id, outbound.route())?;

        let frame = self
            .codec()
            .encode(id, &payload)
            .map_err(|e| RelayError::Frame(e.to_string()))?;
        // On failure `pending` drops here and takes its entry with it.
        outbound.send(frame).await?;

        pending.wait(self.request_timeout).await
    }

    /// Handle a frame from the previous hop: run the stage, then either pass
    /// the output downstream (same id) or, on the tail node, return it.
    pub async fn relay(&self, id: RequestId, payload: Bytes) -> Result<Bytes, RelayError> {
        let output = self
            .stage
            .process(payload)
            .await
            .map_err(|e| RelayError::Stage(e.to_string()))?;

        if self.forward.is_some() {
            self.forward(id, output).await
        } else {
            Ok(output)
        }
    }

    /// Connect (or reconnect) to the configured next hop.
    pub async fn connect(&self) -> Result<String, RelayError> {
        let forward = self.forward.as_deref().ok_or(RelayError::NoForwardAddress)?;
        self.connections.connect(forward).await?;
        Ok(forward.to_string())
    }

    pub async fn local_status(&self) -> NodeStatus {
        NodeStatus {
            forward_address: self.forward.clone(),
            connected: self.connections.is_connected().await,
            pending: self.table.len(),
            version: self.version.clone(),
        }
    }

    /// Tell every peer to connect to its own next hop.
    pub async fn activate(&self) -> FanOutReport {
        self.peers.activate(&self.slices).await
    }

    /// Collect `/healthcheck` from every peer.
    pub async fn aggregate_status(&self) -> FanOutReport {
        self.peers.aggregate_status(&self.slices).await
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Close the outbound connection, failing anything still pending on it.
    pub async fn shutdown(&self) {
        self.trigger_shutdown();
        self.connections.close().await;
        let abandoned = self.table.fail_all(RelayError::ConnectionClosed);
        if abandoned > 0 {
            tracing::warn!(abandoned, "Pending requests failed at shutdown");
        }
    }
}
