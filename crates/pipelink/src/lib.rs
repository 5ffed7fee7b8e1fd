//! pipelink: request/response correlation for chained inference nodes.
//!
//! A request enters the head node over HTTP, gets a fresh [`RequestId`], and
//! travels node to node over framed TCP connections. The result comes back
//! along the same path and is matched to its waiting caller by id, so many
//! requests can be in flight on one connection at once.

mod health;
mod version;

pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod egress;
pub mod error;
pub mod peers;
pub mod relay;
pub mod service;
pub mod stage;
pub mod tensor;
pub mod transport;

pub use bridge::codec::{Frame, FrameCodec, FrameError};
pub use bridge::protocol::RequestId;
pub use config::{ConfigError, NodeConfig};
pub use connection::ConnectionManager;
pub use correlation::{CorrelationTable, PendingResult};
pub use error::RelayError;
pub use health::{FanOutReport, NodeStatus, PeerOutcome, PeerStatus};
pub use peers::{PeerClient, PeerError};
pub use relay::serve_frames;
pub use service::NodeService;
pub use stage::{Passthrough, Stage, StageError};
pub use tensor::{InputShape, TensorError, TensorHeader};
pub use version::{PIPELINK_VERSION, VersionInfo};
