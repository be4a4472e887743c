//! Request execution — the passthrough gate and the two executors.
//!
//! After selection, every translator request goes through [`gate`], which
//! decides between *passthrough* (forward the client's bytes unchanged to a
//! dialect-native backend) and *translate* (re-express the request in the
//! canonical OpenAI shape and reverse-translate the response). Translate is
//! always correct but costs a full parse and re-serialise and loses
//! per-byte streaming fidelity; passthrough preserves vendor-specific
//! fields, so the gate prefers it whenever a capable endpoint subset
//! exists.
//!
//! The streaming executor is the delicate part: the proxy writes into a
//! recorder wrapping one end of an in-memory pipe while the translator
//! drains the other end, with a one-shot `headers_ready` signal as the only
//! synchronisation edge. Teardown must hold under upstream errors, client
//! disconnects, and translator panics without leaving the producer task
//! running — the supervisor task drains both join handles on every path.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::endpoint::Endpoint;
use crate::error::GatewayError;
use crate::headers;
use crate::pipe::{streaming_pipe, BufferedRecorder, RecordedHead, PIPE_CAPACITY};
use crate::profile::ProfileLookup;
use crate::proxy::{ProxyOutcome, ProxyService, UpstreamRequest};
use crate::select::RouteReason;
use crate::stats::{FallbackReason, TranslationMode};
use crate::translator::{PassthroughPlan, TransformedRequest, Translator};

/// Per-request facts the executors stamp into observability headers.
pub struct ExecContext {
    pub request_id: String,
    pub reason: RouteReason,
    pub started: Instant,
}

impl ExecContext {
    /// `mode` is `None` for plain provider forwards, which are neither
    /// passthrough nor translate in the dialect sense.
    fn stamp(&self, out: &mut HeaderMap, mode: Option<TranslationMode>) {
        headers::insert_str(out, headers::REQUEST_ID, &self.request_id);
        headers::insert_str(
            out,
            headers::RESPONSE_TIME,
            &format!("{}ms", self.started.elapsed().as_millis()),
        );
        headers::insert_str(out, headers::ROUTING_STRATEGY, "priority");
        let decision = mode.map(|m| m.as_str()).unwrap_or("proxied");
        headers::insert_str(out, headers::ROUTING_DECISION, decision);
        headers::insert_str(out, headers::ROUTING_REASON, self.reason.as_str());
        if mode == Some(TranslationMode::Passthrough) {
            headers::insert_str(out, headers::MODE, "passthrough");
        }
    }
}

/// The gate's verdict plus everything the chosen executor needs.
pub struct GateOutcome {
    pub mode: TranslationMode,
    pub fallback: FallbackReason,
    pub plan: Plan,
}

pub enum Plan {
    Passthrough { plan: PassthroughPlan, endpoints: Vec<Endpoint> },
    Translate { request: TransformedRequest, original: Value, endpoints: Vec<Endpoint> },
}

/// Decide passthrough vs translate by intersecting endpoint capabilities
/// with translator capabilities.
///
/// Mixed fleets must not block passthrough: when only a subset of the
/// selected endpoints natively speaks the dialect, that subset is carved
/// out and the proxy routes within it alone.
pub fn gate(
    translator: &dyn Translator,
    body: &Bytes,
    endpoints: Vec<Endpoint>,
    profiles: &ProfileLookup,
) -> Result<GateOutcome, GatewayError> {
    debug_assert!(!endpoints.is_empty(), "selector must hand over a non-empty list");

    let translate = |endpoints: Vec<Endpoint>, fallback: FallbackReason| {
        let request = translator.transform_request(body)?;
        let original: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::BadInput(format!("request body is not valid JSON: {e}")))?;
        Ok(GateOutcome {
            mode: TranslationMode::Translate,
            fallback,
            plan: Plan::Translate { request, original, endpoints },
        })
    };

    let Some(passthrough) = translator.passthrough() else {
        return translate(endpoints, FallbackReason::TranslatorDoesNotSupportPassthrough);
    };

    let dialect = translator.dialect().as_str();
    let native: Vec<Endpoint> = endpoints
        .iter()
        .filter(|e| {
            profiles
                .by_type(&e.backend_type)
                .map(|p| p.supports_dialect(dialect))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    if !native.is_empty() && passthrough.can_passthrough(&native, profiles) {
        let plan = passthrough.prepare_passthrough(body, profiles, &native)?;
        return Ok(GateOutcome {
            mode: TranslationMode::Passthrough,
            fallback: FallbackReason::None,
            plan: Plan::Passthrough { plan, endpoints: native },
        });
    }

    translate(endpoints, FallbackReason::CannotPassthrough)
}

/// Await the proxy task and turn its outcome into the caller's error.
async fn join_proxy(t_proxy: JoinHandle<Result<ProxyOutcome, GatewayError>>) -> GatewayError {
    match t_proxy.await {
        Ok(Err(e)) => e,
        Ok(Ok(outcome)) => {
            // Head never arrived yet the forward claims success; treat as a
            // protocol violation by the proxy implementation.
            GatewayError::UpstreamFailure(format!(
                "proxy completed without writing a response head (status {})",
                outcome.status
            ))
        }
        Err(join_err) => GatewayError::UpstreamFailure(format!("proxy task failed: {join_err}")),
    }
}

/// Drain both background tasks of a streaming request. When both report
/// errors the transform error takes precedence: it is the user-visible one.
async fn supervise(
    request_id: String,
    t_xlate: JoinHandle<Result<(), GatewayError>>,
    t_proxy: JoinHandle<Result<ProxyOutcome, GatewayError>>,
) {
    let xlate = t_xlate.await;
    // The pipe ends held by the translator task are dropped by now (normal
    // return or unwind alike), so the proxy cannot block on a full pipe;
    // draining its handle is what keeps panicking requests leak-free.
    let proxy = t_proxy.await;

    match xlate {
        Err(join_err) if join_err.is_panic() => {
            error!(request_id = %request_id, "streaming translator panicked; stream truncated");
        }
        Err(join_err) => {
            error!(request_id = %request_id, error = %join_err, "streaming translator task failed");
        }
        Ok(Err(e)) => {
            warn!(request_id = %request_id, error = %e, "streaming translation failed; stream truncated");
        }
        Ok(Ok(())) => match proxy {
            Ok(Err(e)) => warn!(request_id = %request_id, error = %e, "proxy reported a late stream error"),
            Err(join_err) => error!(request_id = %request_id, error = %join_err, "proxy task failed"),
            Ok(Ok(outcome)) => {
                debug!(request_id = %request_id, endpoint = %outcome.endpoint_name, "stream complete")
            }
        },
    }
}

// ─── Raw forwarding (passthrough + provider forwards) ────────────────────────

/// Forward the client's bytes unchanged and stream the backend's answer
/// back verbatim. Serves both streaming and non-streaming passthrough:
/// nothing is buffered either way.
pub async fn run_passthrough(
    proxy: Arc<dyn ProxyService>,
    plan: PassthroughPlan,
    endpoints: Vec<Endpoint>,
    client_headers: HeaderMap,
    ctx: ExecContext,
) -> Result<Response, GatewayError> {
    let upstream = UpstreamRequest {
        method: Method::POST,
        target_path: plan.target_path,
        headers: client_headers,
        body: plan.body,
        model: plan.model.clone(),
        is_streaming: plan.is_streaming,
    };
    stream_through(proxy, upstream, endpoints, ctx, Some(TranslationMode::Passthrough)).await
}

/// Forward a provider-prefixed request (`/olla/{provider}/…`) verbatim.
/// Same machinery as passthrough, without the translator-mode header.
pub async fn run_forward(
    proxy: Arc<dyn ProxyService>,
    upstream: UpstreamRequest,
    endpoints: Vec<Endpoint>,
    ctx: ExecContext,
) -> Result<Response, GatewayError> {
    stream_through(proxy, upstream, endpoints, ctx, None).await
}

async fn stream_through(
    proxy: Arc<dyn ProxyService>,
    upstream: UpstreamRequest,
    endpoints: Vec<Endpoint>,
    ctx: ExecContext,
    mode: Option<TranslationMode>,
) -> Result<Response, GatewayError> {
    let model = upstream.model.clone();

    let (recorder, reader, head_rx) = streaming_pipe();
    let t_proxy = tokio::spawn(async move {
        let mut recorder = recorder;
        proxy.forward(upstream, &endpoints, &mut recorder).await
    });

    let Ok(head) = head_rx.await else {
        return Err(join_proxy(t_proxy).await);
    };

    let mut response_headers = HeaderMap::new();
    headers::copy_observability(&head.headers, &mut response_headers, model.as_deref());
    if let Some(ct) = head.headers.get(header::CONTENT_TYPE) {
        response_headers.insert(header::CONTENT_TYPE, ct.clone());
    }
    ctx.stamp(&mut response_headers, mode);

    // The proxy keeps feeding the pipe; its handle is drained by a watcher
    // so a client disconnect (body drop → reader close) cannot leak it.
    let request_id = ctx.request_id.clone();
    tokio::spawn(async move {
        match t_proxy.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(request_id = %request_id, error = %e, "passthrough stream ended with error"),
            Err(join_err) => error!(request_id = %request_id, error = %join_err, "proxy task failed"),
        }
    });

    let mut response = Response::builder()
        .status(head.status)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| GatewayError::UpstreamFailure(format!("building response: {e}")))?;
    response.headers_mut().extend(response_headers);
    Ok(response)
}

// ─── Translate, buffered ─────────────────────────────────────────────────────

/// Fields of an OpenAI-shape error body, best-effort.
fn parse_openai_error(body: &[u8]) -> (String, String, Option<String>, Option<String>) {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let text = |key: &str| {
        error
            .and_then(|e| e.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let message = text("message").unwrap_or_else(|| {
        String::from_utf8_lossy(body).chars().take(200).collect::<String>()
    });
    let error_type = text("type").unwrap_or_default();
    (message, error_type, text("param"), text("code"))
}

/// Render an upstream error in the translator's native schema, preserving
/// the upstream status.
fn error_response(
    translator: &dyn Translator,
    status: StatusCode,
    error_type: &str,
    message: &str,
    response_headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let body = match translator.error_writer() {
        Some(writer) => writer.error_body(status, error_type, message),
        None => serde_json::json!({ "error": { "message": message, "type": error_type } }),
    };
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .map_err(|e| GatewayError::UpstreamFailure(format!("building response: {e}")))?;
    response.headers_mut().extend(response_headers);
    Ok(response)
}

/// Buffer the upstream response, transform, emit.
pub async fn run_translate_buffered(
    proxy: Arc<dyn ProxyService>,
    translator: Arc<dyn Translator>,
    request: TransformedRequest,
    original: Value,
    endpoints: Vec<Endpoint>,
    ctx: ExecContext,
) -> Result<Response, GatewayError> {
    let body = serde_json::to_vec(&request.openai_body)
        .map_err(|e| GatewayError::RequestTransform(format!("serialising request: {e}")))?;

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(header::CONTENT_TYPE, "application/json".parse().expect("static"));

    let upstream = UpstreamRequest {
        method: Method::POST,
        target_path: request.target_path().to_string(),
        headers: upstream_headers,
        body: Bytes::from(body),
        model: request.model.clone(),
        is_streaming: false,
    };

    let mut recorder = BufferedRecorder::new();
    proxy.forward(upstream, &endpoints, &mut recorder).await?;

    let head = recorder.head.take().ok_or_else(|| {
        GatewayError::UpstreamFailure("proxy completed without writing a response head".into())
    })?;

    let mut response_headers = HeaderMap::new();
    headers::copy_observability(&head.headers, &mut response_headers, request.model.as_deref());
    ctx.stamp(&mut response_headers, Some(TranslationMode::Translate));

    if head.status.as_u16() >= 400 {
        let (message, error_type, param, code) = parse_openai_error(&recorder.body);
        warn!(
            status = head.status.as_u16(),
            %message,
            error_type,
            param = param.as_deref().unwrap_or(""),
            code = code.as_deref().unwrap_or(""),
            "upstream returned an error response"
        );
        return error_response(&*translator, head.status, &error_type, &message, response_headers);
    }

    let openai: Value = serde_json::from_slice(&recorder.body)
        .map_err(|e| GatewayError::ResponseTransform(format!("upstream body is not JSON: {e}")))?;
    let native = translator.transform_response(&openai, &original)?;
    let body = serde_json::to_vec(&native)
        .map_err(|e| GatewayError::ResponseTransform(format!("serialising response: {e}")))?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| GatewayError::UpstreamFailure(format!("building response: {e}")))?;
    response.headers_mut().extend(response_headers);
    Ok(response)
}

// ─── Translate, streaming ────────────────────────────────────────────────────

/// Pipe the upstream SSE stream through the translator while the proxy
/// task feeds the pipe.
///
/// State machine: spawn the proxy, wait for `headers_ready`, then either
/// drain-and-translate an error body (status ≥ 400) or hand the pipe's
/// read end to the streaming translator and return the response head. The
/// supervisor drains both task handles on every path, including translator
/// panics.
pub async fn run_translate_streaming(
    proxy: Arc<dyn ProxyService>,
    translator: Arc<dyn Translator>,
    request: TransformedRequest,
    original: Value,
    endpoints: Vec<Endpoint>,
    ctx: ExecContext,
) -> Result<Response, GatewayError> {
    let body = serde_json::to_vec(&request.openai_body)
        .map_err(|e| GatewayError::RequestTransform(format!("serialising request: {e}")))?;

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(header::CONTENT_TYPE, "application/json".parse().expect("static"));
    upstream_headers.insert(header::ACCEPT, "text/event-stream".parse().expect("static"));

    let upstream = UpstreamRequest {
        method: Method::POST,
        target_path: request.target_path().to_string(),
        headers: upstream_headers,
        body: Bytes::from(body),
        model: request.model.clone(),
        is_streaming: true,
    };

    let (recorder, mut reader, head_rx) = streaming_pipe();
    let t_proxy = tokio::spawn(async move {
        let mut recorder = recorder;
        proxy.forward(upstream, &endpoints, &mut recorder).await
    });

    let Ok(head) = head_rx.await else {
        return Err(join_proxy(t_proxy).await);
    };

    let mut response_headers = HeaderMap::new();
    headers::copy_observability(&head.headers, &mut response_headers, request.model.as_deref());
    ctx.stamp(&mut response_headers, Some(TranslationMode::Translate));

    if head.status.as_u16() >= 400 {
        return error_streamed_upstream(
            &*translator,
            head,
            &mut reader,
            t_proxy,
            response_headers,
        )
        .await;
    }

    // Client-facing pipe: the translator task produces into it, the
    // response body consumes it.
    let (mut client_writer, client_reader) = tokio::io::duplex(PIPE_CAPACITY);

    let t_xlate = tokio::spawn(async move {
        let result = translator
            .transform_streaming_response(
                Box::new(BufReader::new(reader)),
                &mut client_writer,
                &original,
            )
            .await;
        let _ = client_writer.shutdown().await;
        result
    });

    tokio::spawn(supervise(ctx.request_id.clone(), t_xlate, t_proxy));

    let mut response = Response::builder()
        .status(head.status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReaderStream::new(client_reader)))
        .map_err(|e| GatewayError::UpstreamFailure(format!("building response: {e}")))?;
    response.headers_mut().extend(response_headers);
    Ok(response)
}

/// Streaming request whose upstream answered with an error status before
/// any SSE frame: drain the pipe, join the proxy, translate the error.
async fn error_streamed_upstream(
    translator: &dyn Translator,
    head: RecordedHead,
    reader: &mut tokio::io::DuplexStream,
    t_proxy: JoinHandle<Result<ProxyOutcome, GatewayError>>,
    response_headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let mut body = Vec::new();
    if let Err(e) = reader.read_to_end(&mut body).await {
        warn!(error = %e, "draining upstream error body failed");
    }
    if let Ok(Err(e)) = t_proxy.await {
        debug!(error = %e, "proxy error while collecting upstream error body");
    }

    let (message, error_type, _, _) = parse_openai_error(&body);
    warn!(status = head.status.as_u16(), %message, "upstream rejected streaming request");
    error_response(translator, head.status, &error_type, &message, response_headers)
}
