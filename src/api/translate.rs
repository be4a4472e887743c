//! Translator request handling.
//!
//! Every request that lands on a translator prefix flows through here:
//! profile, select, gate, execute, observe. Exactly one translator event is
//! recorded per request before the response is returned, on every path —
//! early rejects, 503s, oversize bodies, successes and stream setups alike.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::error::GatewayError;
use crate::executor::{self, ExecContext, Plan};
use crate::stats::MetricsSink;
use crate::headers;
use crate::inspect::{Inspection, InspectorChain};
use crate::select;
use crate::state::AppState;
use crate::stats::{FallbackReason, TranslationMode, TranslatorEvent};
use crate::translator::{effective_body_limit, Translator};

/// Facts accumulated along the pipeline for the single per-request event.
struct Facts {
    model: Option<String>,
    mode: TranslationMode,
    fallback: FallbackReason,
    is_streaming: bool,
}

impl Facts {
    fn new() -> Self {
        Self {
            model: None,
            mode: TranslationMode::Translate,
            fallback: FallbackReason::None,
            is_streaming: false,
        }
    }
}

/// Entry point from the path router: `rest` is the path below
/// `/olla/{translator}/`, without its leading slash.
pub async fn dispatch(
    state: Arc<AppState>,
    translator: Arc<dyn Translator>,
    rest: &str,
    method: Method,
    request_headers: HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let mut facts = Facts::new();

    let messages_path = translator.route_path().unwrap_or("/v1/messages");
    let messages_tail = messages_path.trim_start_matches('/');
    let count_tail = format!("{messages_tail}/count_tokens");

    let result = if method == Method::POST && rest == messages_tail {
        messages(&state, &translator, request_headers, body, &request_id, &mut facts).await
    } else if method == Method::POST && rest == count_tail {
        count_tokens(&state, &translator, &body, &mut facts)
    } else if method == Method::GET && rest == "v1/models" {
        Ok(dialect_models(&state))
    } else {
        Err(GatewayError::BadInput(format!(
            "no `{}` route at `/{rest}`",
            translator.name()
        )))
    };

    // The single metrics event, before the response leaves the handler.
    let success = result.is_ok();
    let event = TranslatorEvent::new(
        translator.name(),
        facts.mode,
        started.elapsed().as_millis() as u64,
        success,
    )
    .with_model(facts.model.as_deref())
    .with_fallback(facts.fallback)
    .streaming(facts.is_streaming);
    state.events.record(event);

    match result {
        Ok(response) => response,
        Err(e) => error_in_dialect(&*translator, e, &request_id),
    }
}

/// The messages pipeline proper.
async fn messages(
    state: &Arc<AppState>,
    translator: &Arc<dyn Translator>,
    request_headers: HeaderMap,
    body: Bytes,
    request_id: &str,
    facts: &mut Facts,
) -> Result<Response, GatewayError> {
    let configured = state
        .config
        .translator(translator.name())
        .and_then(|t| t.max_message_size);
    let limit = effective_body_limit(&**translator, configured);
    if body.len() > limit {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    // Profile the request; the body buffer is shared, never consumed.
    let profile = InspectorChain::strict().profile(
        &Inspection { path: "/v1/messages", headers: &request_headers, body: &body },
        translator.dialect(),
        &state.profiles,
    )?;
    facts.model = profile.model.clone();
    facts.is_streaming = profile.is_streaming;

    // Candidate endpoints, or 503 when nothing speaks the dialect.
    let selection =
        match select::by_dialect(&profile, state.endpoints.healthy(), &*state.registry) {
            Ok(s) => s,
            Err(e) => {
                facts.fallback = FallbackReason::NoCompatibleEndpoints;
                return Err(e);
            }
        };

    // Passthrough vs translate.
    let outcome = executor::gate(&**translator, &body, selection.endpoints, &state.profiles)?;
    facts.mode = outcome.mode;
    facts.fallback = outcome.fallback;

    debug!(
        translator = translator.name(),
        mode = outcome.mode.as_str(),
        fallback = outcome.fallback.as_str(),
        reason = selection.decision.reason.as_str(),
        model = facts.model.as_deref().unwrap_or(""),
        streaming = facts.is_streaming,
        "dispatching translator request"
    );

    let ctx = ExecContext {
        request_id: request_id.to_string(),
        reason: selection.decision.reason,
        started: Instant::now(),
    };

    match outcome.plan {
        Plan::Passthrough { plan, endpoints } => {
            facts.model = plan.model.clone().or(facts.model.take());
            facts.is_streaming = plan.is_streaming;
            executor::run_passthrough(
                state.proxy.clone(),
                plan,
                endpoints,
                request_headers,
                ctx,
            )
            .await
        }
        Plan::Translate { request, original, endpoints } => {
            facts.model = request.model.clone().or(facts.model.take());
            facts.is_streaming = request.is_streaming;
            if request.is_streaming {
                executor::run_translate_streaming(
                    state.proxy.clone(),
                    translator.clone(),
                    request,
                    original,
                    endpoints,
                    ctx,
                )
                .await
            } else {
                executor::run_translate_buffered(
                    state.proxy.clone(),
                    translator.clone(),
                    request,
                    original,
                    endpoints,
                    ctx,
                )
                .await
            }
        }
    }
}

/// `POST /olla/{translator}/v1/messages/count_tokens`.
fn count_tokens(
    state: &Arc<AppState>,
    translator: &Arc<dyn Translator>,
    body: &Bytes,
    facts: &mut Facts,
) -> Result<Response, GatewayError> {
    let configured = state
        .config
        .translator(translator.name())
        .and_then(|t| t.max_message_size);
    let limit = effective_body_limit(&**translator, configured);
    if body.len() > limit {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    let counter = translator.token_counter().ok_or_else(|| {
        GatewayError::BadInput(format!(
            "translator `{}` does not support token counting",
            translator.name()
        ))
    })?;

    if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(body) {
        facts.model = parsed
            .get("model")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
    }

    let counted = counter.count_tokens(body)?;
    Ok(Json(counted).into_response())
}

/// `GET /olla/{translator}/v1/models` — the catalog in the dialect's own
/// listing shape.
fn dialect_models(state: &Arc<AppState>) -> Response {
    let healthy = state.endpoints.healthy();
    let healthy_names: Vec<&str> = healthy.iter().map(|e| e.name.as_str()).collect();

    let data: Vec<serde_json::Value> = state
        .registry
        .unified_models()
        .into_iter()
        .filter(|m| m.available_on(&healthy_names))
        .map(|m| {
            json!({
                "type": "model",
                "id": m.id,
                "display_name": m.id,
                "created_at": m.last_seen,
            })
        })
        .collect();

    let first_id = data.first().and_then(|m| m.get("id").cloned());
    let last_id = data.last().and_then(|m| m.get("id").cloned());
    Json(json!({
        "data": data,
        "has_more": false,
        "first_id": first_id,
        "last_id": last_id,
    }))
    .into_response()
}

/// Map a pipeline error onto the translator's native error type name, when
/// the schema has one; empty lets the writer derive from the status.
fn error_type_of(err: &GatewayError) -> &str {
    match err {
        GatewayError::BadInput(_) | GatewayError::RequestTransform(_) => "invalid_request_error",
        GatewayError::PayloadTooLarge { .. } => "request_too_large",
        GatewayError::ModelNotAvailable(_) => "not_found_error",
        GatewayError::UpstreamErrorResponse { error_type, .. } => {
            error_type.as_deref().unwrap_or("")
        }
        _ => "",
    }
}

/// Render a pipeline error in the translator's dialect (generic envelope
/// when the translator has no error writer).
fn error_in_dialect(translator: &dyn Translator, err: GatewayError, request_id: &str) -> Response {
    let Some(writer) = translator.error_writer() else {
        return err.into_response();
    };

    let status = err.status();
    tracing::warn!(kind = err.kind(), error = %err, "translator request failed");
    let body = writer.error_body(status, error_type_of(&err), &err.to_string());

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    headers::insert_str(response.headers_mut(), headers::REQUEST_ID, request_id);
    response
}
