//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};

use crate::error::RelayError;
use crate::health::{FanOutReport, NodeStatus, is_degraded};
use crate::service::NodeService;

fn error_status(error: &RelayError) -> StatusCode {
    if error.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// 200 when every peer answered, 207 Multi-Status when some did not.
fn fan_out_response(report: FanOutReport) -> (StatusCode, Json<FanOutReport>) {
    let status = if is_degraded(&report) {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

async fn input(State(service): State<Arc<NodeService>>, body: Bytes) -> Response {
    match service.submit(body).await {
        Ok(result) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            result,
        )
            .into_response(),
        Err(e) => {
            if e.is_client_error() {
                tracing::info!(error = %e, "Rejected input");
            } else {
                tracing::error!(error = %e, "Input failed");
            }
            (error_status(&e), e.to_string()).into_response()
        }
    }
}

async fn connect(State(service): State<Arc<NodeService>>) -> (StatusCode, String) {
    match service.connect().await {
        Ok(addr) => (StatusCode::OK, format!("Connected to {addr}")),
        Err(e) => {
            tracing::error!(error = %e, "Connect failed");
            (error_status(&e), e.to_string())
        }
    }
}

async fn activate(State(service): State<Arc<NodeService>>) -> impl IntoResponse {
    fan_out_response(service.activate().await)
}

async fn healthcheck(State(service): State<Arc<NodeService>>) -> Json<NodeStatus> {
    Json(service.local_status().await)
}

async fn worker_healthcheck(State(service): State<Arc<NodeService>>) -> impl IntoResponse {
    fan_out_response(service.aggregate_status().await)
}

pub fn routes(service: Arc<NodeService>) -> Router {
    // Tensors routinely exceed axum's 2 MiB default.
    let body_limit = service.codec().max_frame_bytes();

    Router::new()
        .route("/input", post(input))
        .route("/connect", get(connect))
        .route("/activate", get(activate))
        .route("/healthcheck", get(healthcheck))
        .route("/workerhealthcheck", get(worker_healthcheck))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}
