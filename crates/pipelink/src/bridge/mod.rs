//! Node-to-node bridge.
//!
//! # Architecture
//!
//! - **protocol**: Request ids and their fixed-width wire form
//! - **codec**: Frame bodies (`zstd(id ++ payload)`) and length-prefix framing
//! - **transport**: TCP dial/accept producing framed read and write halves

pub mod codec;
pub mod protocol;
pub mod transport;
