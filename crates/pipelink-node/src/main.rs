//! pipelink-node: one stage of a chained inference pipeline.
//!
//! Configuration comes from the environment (see `NodeConfig::from_env`).

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pipelink::bridge::transport::bind;
use pipelink::transport::{ServerConfig, serve};
use pipelink::{NodeConfig, NodeService, PIPELINK_VERSION, Passthrough, serve_frames};

/// Initialize tracing with PIPELINK_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PIPELINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "pipelink={level},pipelink_node={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = NodeConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        version = PIPELINK_VERSION,
        input_dims = %config.input_shape,
        forward = ?config.forward,
        peers = config.slices.len(),
        "Starting pipelink node"
    );

    let service = Arc::new(
        NodeService::new(&config, Arc::new(Passthrough)).context("failed to build peer client")?,
    );

    let frame_addr = config.frame_addr();
    let listener = bind(frame_addr.as_str())
        .await
        .with_context(|| format!("failed to bind frame listener on {frame_addr}"))?;
    let frames = tokio::spawn(serve_frames(listener, Arc::clone(&service)));

    serve(ServerConfig::from(&config), service).await?;

    if let Err(e) = frames.await {
        tracing::warn!(error = %e, "Frame listener task ended abnormally");
    }

    Ok(())
}
