//! HTTP control surface via axum.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve};
