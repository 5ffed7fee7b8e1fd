//! Transport layer for pipelink.
//!
//! The HTTP control surface lives here. Node-to-node frames use the TCP
//! transport in [`crate::bridge`].

pub mod http;

pub use http::{ServerConfig, serve};
