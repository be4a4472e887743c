//! Provider-scoped model listings and unsupported management paths.
//!
//! `/olla/{provider}/api/tags`, `/olla/{provider}/v1/models` and the LM
//! Studio alternates render the registry filtered to that provider's
//! endpoints, in that provider's native schema — thin format converters
//! over the same catalog `/olla/models` serves.
//!
//! Ollama's management endpoints (`/api/pull`, `/api/delete`, …) are
//! deliberately unsupported: mutating models across a multi-instance fleet
//! would need coordination this gateway does not provide, so they answer
//! `501` with a terse message instead of silently picking one instance.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::api::models::{render_lmstudio, render_ollama, render_openai};
use crate::registry::UnifiedModel;
use crate::state::AppState;

/// Ollama management paths this gateway refuses to proxy.
pub const UNSUPPORTED_MANAGEMENT: &[&str] = &[
    "api/pull",
    "api/push",
    "api/create",
    "api/copy",
    "api/delete",
    "api/show",
    "api/list",
];

/// Models served by at least one endpoint of `backend_type`, with sources
/// narrowed to that provider's endpoints.
fn models_for_type(state: &AppState, backend_type: &str) -> Vec<UnifiedModel> {
    state
        .registry
        .unified_models()
        .into_iter()
        .filter_map(|mut m| {
            m.sources.retain(|s| s.backend_type == backend_type);
            if m.sources.is_empty() {
                None
            } else {
                Some(m)
            }
        })
        .collect()
}

fn healthy_names(state: &AppState) -> Vec<String> {
    state.endpoints.healthy().into_iter().map(|e| e.name).collect()
}

/// `GET /olla/{provider}/api/tags` — Ollama-native listing.
pub fn ollama_tags(state: &AppState, backend_type: &str) -> Response {
    Json(render_ollama(&models_for_type(state, backend_type))).into_response()
}

/// `GET /olla/{provider}/v1/models` — OpenAI-compatible listing.
pub fn openai_models(state: &AppState, backend_type: &str) -> Response {
    Json(render_openai(&models_for_type(state, backend_type))).into_response()
}

/// `GET /olla/{provider}/api/v0/models` (and `/api/v1/models`) — LM Studio
/// enhanced listing.
pub fn lmstudio_models(state: &AppState, backend_type: &str) -> Response {
    let names = healthy_names(state);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    Json(render_lmstudio(&models_for_type(state, backend_type), &names)).into_response()
}

/// `501` for management paths.
pub fn unsupported_management(path: &str) -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": format!("`/{path}` is not supported: model management across multiple instances is out of scope"),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_paths_cover_all_mutating_ollama_endpoints() {
        for p in ["api/pull", "api/push", "api/create", "api/copy", "api/delete"] {
            assert!(UNSUPPORTED_MANAGEMENT.contains(&p));
        }
    }

    #[test]
    fn unsupported_management_is_501() {
        let resp = unsupported_management("api/pull");
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
