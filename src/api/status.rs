//! Operator-facing introspection endpoints (`/internal/*`, `/version`).
//!
//! These are served from the same listener as the proxy surface; deploy
//! behind a network boundary if the gateway fronts untrusted clients.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::endpoint::HealthStatus;
use crate::state::AppState;

/// `GET /internal/status` — one-page summary of the gateway.
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let endpoints = state.endpoints.all();
    let count = |s: HealthStatus| endpoints.iter().filter(|e| e.status == s).count();

    let models = state.registry.unified_models();
    let translator_stats = state.events.translator_stats().await;
    let total_requests: usize = translator_stats.iter().map(|t| t.total).sum();

    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "endpoints": {
            "total": endpoints.len(),
            "healthy": count(HealthStatus::Healthy),
            "unhealthy": count(HealthStatus::Unhealthy),
            "offline": count(HealthStatus::Offline),
        },
        "models": models.len(),
        "translators": state.translators.names(),
        "translator_requests": total_requests,
    }))
}

/// `GET /internal/status/endpoints` — full endpoint detail with health
/// metadata.
pub async fn endpoints(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "endpoints": state.endpoints.all() }))
}

/// `GET /internal/status/models` — the raw unified catalog, sources and all.
pub async fn models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models = state.registry.unified_models();
    Json(json!({ "count": models.len(), "models": models }))
}

/// `GET /internal/stats/models` — request counts per model over the recent
/// event window.
pub async fn model_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "models": state.events.model_counts().await }))
}

/// `GET /internal/stats/translators` — per-translator aggregates.
pub async fn translator_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "translators": state.events.translator_stats().await }))
}

/// `GET /internal/process` — process-level facts.
pub async fn process(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "pid": std::process::id(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /version`.
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
