// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The API is read-mostly: state
// snapshots for a dashboard, plus pause/resume/kill controls. CORS is
// permissive for development; tighten `allow_origin` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::EngineState;
use crate::types::TradingMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    feed_degraded: bool,
}

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
        feed_degraded: state.feed.any_degraded(),
    })
}

async fn full_state(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.store.iter_open())
}

async fn decisions(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.recent_decisions.read().clone())
}

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
}

async fn control_pause(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    state.config.write().trading_mode = TradingMode::Paused;
    state.increment_version();
    info!("trading paused via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Paused.to_string(),
    })
}

async fn control_resume(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    {
        let mut config = state.config.write();
        if config.trading_mode == TradingMode::Killed {
            warn!("resume requested on a killed engine — clearing risk latches");
            state.risk.reset();
        }
        config.trading_mode = TradingMode::Live;
    }
    state.increment_version();
    info!("trading resumed via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Live.to_string(),
    })
}

async fn control_kill(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    state.config.write().trading_mode = TradingMode::Killed;
    state.risk.kill();
    state.increment_version();
    warn!("kill switch engaged via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Killed.to_string(),
    })
}
