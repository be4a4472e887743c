//! Generic provider forwarding (`/olla/{provider}/{upstream-path}`).
//!
//! No dialect translation happens here: the request is profiled for a
//! model name, candidates of the provider's backend type are selected, and
//! the bytes are streamed through untouched with the route prefix stripped.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;

use crate::error::GatewayError;
use crate::executor::{self, ExecContext};
use crate::inspect::{Inspection, InspectorChain};
use crate::profile::Dialect;
use crate::proxy::UpstreamRequest;
use crate::select;
use crate::state::AppState;

pub async fn forward(
    state: &Arc<AppState>,
    backend_type: &str,
    target_path: String,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    request_id: String,
) -> Result<Response, GatewayError> {
    let limit = state.config.server.max_body_size;
    if body.len() > limit {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    // Lenient: provider-native bodies are not necessarily JSON.
    let profile = InspectorChain::lenient().profile(
        &Inspection { path: &target_path, headers: &headers, body: &body },
        Dialect::OpenAI,
        &state.profiles,
    )?;

    let selection = select::by_backend_type(
        backend_type,
        profile.model.as_deref(),
        state.endpoints.healthy(),
        &*state.registry,
    )?;

    let ctx = ExecContext {
        request_id,
        reason: selection.decision.reason,
        started: Instant::now(),
    };
    let upstream = UpstreamRequest {
        method,
        target_path,
        headers,
        body,
        model: profile.model.clone(),
        is_streaming: profile.is_streaming,
    };

    executor::run_forward(state.proxy.clone(), upstream, selection.endpoints, ctx).await
}
