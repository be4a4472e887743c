//! Route registration and the `/olla/{provider}` path router.
//!
//! Static surfaces (`/internal/*`, `/version`, `/olla/models`) dispatch
//! directly; everything under `/olla/{provider}/…` goes through a single
//! dispatcher that normalises the provider segment, resolves it to a
//! translator or a backend profile, and hands off to the right handler.
//! The path forwarded upstream is never rewritten beyond stripping the
//! `/olla/{provider}` prefix — only a translator may set a target path.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Extension, OriginalUri, Path, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use tracing::debug;

use crate::api::{forward, health, models, provider_models, request_id, status, translate};
use crate::api::request_id::RequestId;
use crate::config::normalize_prefix;
use crate::error::GatewayError;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    // Slack above the configured ceiling so bodies just over a limit reach
    // the handlers, which reject with a proper dialect-formatted 413 and
    // still record their metrics event. Grossly oversized bodies are cut
    // off here.
    let body_limit = state.config.server.max_body_size.saturating_add(64 * 1024);

    Router::new()
        .route("/internal/health", get(health::health))
        .route("/internal/status", get(status::status))
        .route("/internal/status/endpoints", get(status::endpoints))
        .route("/internal/status/models", get(status::models))
        .route("/internal/stats/models", get(status::model_stats))
        .route("/internal/stats/translators", get(status::translator_stats))
        .route("/internal/process", get(status::process))
        .route("/version", get(status::version))
        .route("/olla/models", get(models::list_models))
        .route("/olla/models/{id}", get(models::get_model))
        .route("/olla/{provider}", any(provider_root))
        .route("/olla/{provider}/{*rest}", any(provider_dispatch))
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// `/olla/{provider}` with no sub-path: forward to the backend root.
async fn provider_root(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, provider, String::new(), None, method, headers, body, request_id).await
}

/// `/olla/{provider}/{rest}` — the provider path dispatcher.
async fn provider_dispatch(
    State(state): State<Arc<AppState>>,
    Path((provider, rest)): Path<(String, String)>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = uri.query().map(str::to_string);
    dispatch(state, provider, rest, query, method, headers, body, request_id).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: Arc<AppState>,
    provider: String,
    rest: String,
    query: Option<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let normalized = normalize_prefix(&provider);

    // Translator prefixes take precedence; config validation guarantees
    // they never collide with profile prefixes.
    if let Some(translator) = state.translators.get(&normalized) {
        return translate::dispatch(state, translator, &rest, method, headers, body, request_id)
            .await;
    }

    let Some(backend_type) = state.profiles.resolve_prefix(&normalized) else {
        return GatewayError::BadInput(format!("unknown provider `{provider}`")).into_response();
    };
    let backend_type = backend_type.to_string();

    debug!(original_path = %format!("/olla/{provider}/{rest}"), provider = %backend_type, "routing provider request");

    // Aggregated listings are answered locally; the backend never sees them.
    if method == Method::GET {
        match rest.as_str() {
            "api/tags" if backend_type == "ollama" => {
                return provider_models::ollama_tags(&state, &backend_type);
            }
            "v1/models" => {
                return provider_models::openai_models(&state, &backend_type);
            }
            "api/v0/models" | "api/v1/models" if backend_type == "lm-studio" => {
                return provider_models::lmstudio_models(&state, &backend_type);
            }
            _ => {}
        }
    }

    if provider_models::UNSUPPORTED_MANAGEMENT.contains(&rest.as_str()) {
        return provider_models::unsupported_management(&rest);
    }

    let target_path = match &query {
        Some(q) => format!("/{rest}?{q}"),
        None => format!("/{rest}"),
    };

    forward::forward(&state, &backend_type, target_path, method, headers, body, request_id)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}
