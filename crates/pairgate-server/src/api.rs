use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Semaphore;
use tracing::warn;

use pairgate_core::{FailureKind, PairingController, PairingOutcome};

use crate::{
    metrics::PairingMetrics,
    rate_limit::RateLimiter,
    sessions::{self, SessionRegistry},
};

/// Text returned alongside a pairing code.
#[derive(Debug, Clone)]
pub struct PairingCopy {
    pub message: String,
    pub instructions: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub controller: PairingController,
    pub sessions: SessionRegistry,
    pub rate_limiter: RateLimiter,
    pub metrics: Arc<PairingMetrics>,
    pub copy: Arc<PairingCopy>,
    /// One permit per session allowed to run at once.
    pub capacity: Arc<Semaphore>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub success: bool,
    pub qr: String,
    pub session_id: String,
    pub message: String,
    pub instructions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

fn failure_status(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::TimedOut => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// GET /
pub async fn get_pairing(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    // A request refused for capacity never reaches the rate limiter.
    let Ok(permit) = Arc::clone(&state.capacity).try_acquire_owned() else {
        warn!(active = state.sessions.len(), "refusing pairing request, session capacity reached");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "too many active pairing sessions");
    };

    if let Err(retry_after) = state.rate_limiter.check(addr.ip()) {
        state.metrics.rate_limit_hits.inc();
        let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
        response
            .headers_mut()
            .insert("Retry-After", HeaderValue::from(retry_after));
        return response;
    }

    let pending = state.controller.start();
    state.metrics.sessions_started.inc();
    sessions::supervise(
        &state.sessions,
        &state.metrics,
        state.controller.faults(),
        pending.id.clone(),
        pending.task,
        permit,
    );

    match pending.outcome.await {
        Ok(PairingOutcome::CodeReady {
            session_id,
            qr_data_url,
        }) => (
            StatusCode::OK,
            Json(PairingResponse {
                success: true,
                qr: qr_data_url,
                session_id: session_id.to_string(),
                message: state.copy.message.clone(),
                instructions: state.copy.instructions.clone(),
            }),
        )
            .into_response(),
        Ok(PairingOutcome::Failed { session_id, kind }) => {
            warn!(session_id = %session_id, ?kind, "pairing request failed");
            error_response(failure_status(kind), kind.message())
        }
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pairing session ended without a result",
        ),
    }
}

// GET /health
pub async fn get_health(State(state): State<AppState>) -> Response {
    use serde_json::json;

    let response = json!({
        "status": "healthy",
        "activeSessions": state.sessions.len(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(response)).into_response()
}

// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
