//! Anthropic Messages dialect translator.
//!
//! Converts between Anthropic's [`/v1/messages`](https://docs.anthropic.com/en/api/messages)
//! schema and the canonical OpenAI chat-completions shape the proxy speaks
//! to backends. Backends that natively serve the Messages API (declared in
//! their profile's dialect table) are reached by passthrough instead; this
//! module supplies both paths plus the dialect's error schema and its
//! token-counting endpoint.
//!
//! # Protocol differences handled here
//!
//! | Concern | Anthropic | OpenAI |
//! |---|---|---|
//! | System prompt | Top-level `system` field | First message with `role: "system"` |
//! | Max tokens | **Required** (`max_tokens`) | Optional (`max_tokens`) |
//! | Stop reasons | `"end_turn"`, `"max_tokens"` | `"stop"`, `"length"` |
//! | Response shape | `content[].text` | `choices[].message.content` |
//! | Streaming | Typed SSE events | `data:` chunks + `[DONE]` |

use std::sync::OnceLock;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::{json, Value};
use tiktoken_rs::CoreBPE;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};
use uuid::Uuid;

use super::{
    ErrorWriter, PassthroughCapable, PassthroughPlan, TokenCounter, TransformedRequest, Translator,
    DEFAULT_MAX_BODY_SIZE,
};
use crate::endpoint::Endpoint;
use crate::error::GatewayError;
use crate::profile::{Dialect, ProfileLookup};

pub struct AnthropicTranslator {
    bpe: OnceLock<CoreBPE>,
}

impl AnthropicTranslator {
    pub fn new() -> Self {
        Self { bpe: OnceLock::new() }
    }

    fn encoder(&self) -> &CoreBPE {
        self.bpe.get_or_init(|| {
            tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary must load")
        })
    }
}

impl Default for AnthropicTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for AnthropicTranslator {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Anthropic
    }

    fn transform_request(&self, body: &[u8]) -> Result<TransformedRequest, GatewayError> {
        let request: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::BadInput(format!("request body is not valid JSON: {e}")))?;
        to_openai(&request)
    }

    fn transform_response(&self, openai: &Value, original: &Value) -> Result<Value, GatewayError> {
        from_openai(openai, original)
    }

    async fn transform_streaming_response(
        &self,
        upstream: Box<dyn AsyncBufRead + Send + Unpin>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        original: &Value,
    ) -> Result<(), GatewayError> {
        stream_to_anthropic(upstream, out, original).await
    }

    fn passthrough(&self) -> Option<&dyn PassthroughCapable> {
        Some(self)
    }

    fn error_writer(&self) -> Option<&dyn ErrorWriter> {
        Some(self)
    }

    fn token_counter(&self) -> Option<&dyn TokenCounter> {
        Some(self)
    }

    fn max_body_size(&self) -> Option<usize> {
        Some(DEFAULT_MAX_BODY_SIZE)
    }

    fn route_path(&self) -> Option<&'static str> {
        Some("/v1/messages")
    }
}

impl PassthroughCapable for AnthropicTranslator {
    fn can_passthrough(&self, endpoints: &[Endpoint], profiles: &ProfileLookup) -> bool {
        !endpoints.is_empty()
            && endpoints.iter().all(|e| {
                profiles
                    .by_type(&e.backend_type)
                    .map(|p| p.supports_dialect("anthropic"))
                    .unwrap_or(false)
            })
    }

    fn prepare_passthrough(
        &self,
        body: &Bytes,
        profiles: &ProfileLookup,
        endpoints: &[Endpoint],
    ) -> Result<PassthroughPlan, GatewayError> {
        let request: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::BadInput(format!("request body is not valid JSON: {e}")))?;

        let target_path = endpoints
            .first()
            .and_then(|e| profiles.by_type(&e.backend_type))
            .and_then(|p| p.dialect_path("anthropic"))
            .unwrap_or("/v1/messages")
            .to_string();

        Ok(PassthroughPlan {
            body: body.clone(),
            target_path,
            model: request.get("model").and_then(Value::as_str).map(str::to_string),
            is_streaming: request.get("stream").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

impl ErrorWriter for AnthropicTranslator {
    fn error_body(&self, status: StatusCode, error_type: &str, message: &str) -> Value {
        let error_type = if error_type.is_empty() {
            default_error_type(status)
        } else {
            error_type
        };
        json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        })
    }
}

impl TokenCounter for AnthropicTranslator {
    fn count_tokens(&self, body: &[u8]) -> Result<Value, GatewayError> {
        let request: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::BadInput(format!("request body is not valid JSON: {e}")))?;

        let mut text = String::new();
        if let Some(system) = request.get("system") {
            collect_text(system, &mut text)?;
        }
        let messages = request
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::BadInput("`messages` array is required".into()))?;
        for msg in messages {
            if let Some(content) = msg.get("content") {
                collect_text(content, &mut text)?;
            }
        }

        let input_tokens = self.encoder().encode_with_special_tokens(&text).len();
        Ok(json!({ "input_tokens": input_tokens }))
    }
}

/// Anthropic error type conventionally paired with an HTTP status.
fn default_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) for unit testing
// ─────────────────────────────────────────────────────────────────────────────

/// Flatten Anthropic content (string or block array) into plain text.
///
/// Non-text blocks have no chat-completions equivalent this gateway can
/// express, so they are rejected rather than silently dropped.
fn collect_text(content: &Value, into: &mut String) -> Result<(), GatewayError> {
    match content {
        Value::String(s) => {
            into.push_str(s);
            Ok(())
        }
        Value::Array(blocks) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            into.push_str(text);
                        }
                    }
                    Some(other) => {
                        return Err(GatewayError::RequestTransform(format!(
                            "unsupported content block type `{other}`"
                        )));
                    }
                    None => {
                        return Err(GatewayError::RequestTransform(
                            "content block missing `type`".into(),
                        ));
                    }
                }
            }
            Ok(())
        }
        _ => Err(GatewayError::RequestTransform("`content` must be a string or array".into())),
    }
}

/// Convert an Anthropic Messages request to the OpenAI chat-completions shape.
pub(crate) fn to_openai(request: &Value) -> Result<TransformedRequest, GatewayError> {
    let model = request
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::BadInput("`model` field is required".into()))?
        .to_string();

    let raw_messages = request
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::BadInput("`messages` array is required".into()))?;

    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len() + 1);

    // Anthropic carries the system prompt as a top-level field; OpenAI wants
    // it as the first message.
    if let Some(system) = request.get("system") {
        let mut text = String::new();
        collect_text(system, &mut text)?;
        if !text.is_empty() {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    for msg in raw_messages {
        let role = msg
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::BadInput("message missing `role`".into()))?;
        let content = msg
            .get("content")
            .ok_or_else(|| GatewayError::BadInput("message missing `content`".into()))?;
        let mut text = String::new();
        collect_text(content, &mut text)?;
        messages.push(json!({ "role": role, "content": text }));
    }

    let is_streaming = request.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let mut openai = json!({
        "model": model,
        "messages": messages,
        "stream": is_streaming,
    });

    if let Some(max_tokens) = request.get("max_tokens").and_then(Value::as_u64) {
        openai["max_tokens"] = json!(max_tokens);
    }
    if let Some(temp) = request.get("temperature").and_then(Value::as_f64) {
        openai["temperature"] = json!(temp);
    }
    if let Some(top_p) = request.get("top_p").and_then(Value::as_f64) {
        openai["top_p"] = json!(top_p);
    }
    if let Some(stop) = request.get("stop_sequences") {
        openai["stop"] = stop.clone();
    }

    Ok(TransformedRequest {
        openai_body: openai,
        model: Some(model),
        is_streaming,
        target_path: None,
    })
}

/// Map an OpenAI finish reason onto an Anthropic stop reason.
fn stop_reason(finish_reason: &str) -> &str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        other => other,
    }
}

/// Convert a buffered OpenAI chat-completions response to the Anthropic
/// Messages shape.
pub(crate) fn from_openai(openai: &Value, original: &Value) -> Result<Value, GatewayError> {
    let choice = openai
        .pointer("/choices/0")
        .ok_or_else(|| GatewayError::ResponseTransform("response has no choices".into()))?;

    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let model = openai
        .get("model")
        .and_then(Value::as_str)
        .or_else(|| original.get("model").and_then(Value::as_str))
        .unwrap_or("unknown");

    let finish = choice.get("finish_reason").and_then(Value::as_str).unwrap_or("stop");

    let input_tokens = openai.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output_tokens =
        openai.pointer("/usage/completion_tokens").and_then(Value::as_u64).unwrap_or(0);

    let id = openai
        .get("id")
        .and_then(Value::as_str)
        .map(|id| format!("msg_{id}"))
        .unwrap_or_else(new_message_id);

    Ok(json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": text }],
        "stop_reason": stop_reason(finish),
        "stop_sequence": null,
        "usage": { "input_tokens": input_tokens, "output_tokens": output_tokens },
    }))
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming translation
// ─────────────────────────────────────────────────────────────────────────────

async fn write_event(
    out: &mut (dyn AsyncWrite + Send + Unpin),
    event: &str,
    data: &Value,
) -> Result<(), GatewayError> {
    let frame = format!("event: {event}\ndata: {data}\n\n");
    out.write_all(frame.as_bytes())
        .await
        .map_err(|e| GatewayError::StreamFailure(format!("writing `{event}` event: {e}")))
}

struct StreamState {
    started: bool,
    finished: bool,
    model: String,
    message_id: String,
    finish_reason: Option<String>,
    output_tokens: u64,
}

impl StreamState {
    fn new(original: &Value) -> Self {
        Self {
            started: false,
            finished: false,
            model: original
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message_id: new_message_id(),
            finish_reason: None,
            output_tokens: 0,
        }
    }

    async fn ensure_started(
        &mut self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), GatewayError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        write_event(
            out,
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                }
            }),
        )
        .await?;
        write_event(
            out,
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" }
            }),
        )
        .await
    }

    async fn on_chunk(
        &mut self,
        chunk: &Value,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), GatewayError> {
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            if !self.started {
                self.model = model.to_string();
            }
        }
        self.ensure_started(out).await?;

        if let Some(text) = chunk.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            if !text.is_empty() {
                write_event(
                    out,
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": { "type": "text_delta", "text": text }
                    }),
                )
                .await?;
            }
        }

        if let Some(reason) = chunk.pointer("/choices/0/finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(tokens) = chunk.pointer("/usage/completion_tokens").and_then(Value::as_u64) {
            self.output_tokens = tokens;
        }
        Ok(())
    }

    async fn finish(
        &mut self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), GatewayError> {
        if self.finished {
            return Ok(());
        }
        // An upstream that produced nothing still gets a well-formed frame
        // sequence — clients expect message_start before message_stop.
        self.ensure_started(out).await?;
        self.finished = true;

        write_event(
            out,
            "content_block_stop",
            &json!({ "type": "content_block_stop", "index": 0 }),
        )
        .await?;

        let reason = self.finish_reason.as_deref().unwrap_or("stop");
        write_event(
            out,
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason(reason), "stop_sequence": null },
                "usage": { "output_tokens": self.output_tokens }
            }),
        )
        .await?;

        write_event(out, "message_stop", &json!({ "type": "message_stop" })).await
    }
}

/// Consume an OpenAI SSE stream and emit Anthropic Messages SSE.
///
/// Unknown lines (comments, keep-alives, `event:` fields) are skipped;
/// chunks that fail to parse are skipped too, since aborting mid-stream
/// would truncate the client harder than dropping one malformed delta.
async fn stream_to_anthropic(
    upstream: Box<dyn AsyncBufRead + Send + Unpin>,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    original: &Value,
) -> Result<(), GatewayError> {
    let mut reader = upstream;
    let mut state = StreamState::new(original);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| GatewayError::StreamFailure(format!("reading upstream stream: {e}")))?;
        if n == 0 {
            break;
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = trimmed.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            state.finish(out).await?;
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if state.finished {
            continue;
        }
        state.on_chunk(&chunk, out).await?;
    }

    // Upstream closed without [DONE]: close the frame sequence anyway.
    state.finish(out).await?;
    out.flush()
        .await
        .map_err(|e| GatewayError::StreamFailure(format!("flushing translated stream: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::endpoint::HealthStatus;
    use std::time::Duration;

    fn profiles() -> ProfileLookup {
        let config: Config = toml::from_str(
            r#"
            [profiles.ollama]
            prefixes = ["ollama"]
            [profiles.ollama.api]
            model_discovery_path = "/api/tags"
            openai_compatible = true

            [profiles.vllm]
            prefixes = ["vllm"]
            [profiles.vllm.api]
            model_discovery_path = "/v1/models"
            openai_compatible = true
            [profiles.vllm.dialects.anthropic]
            enabled = true
            messages_path = "/v1/messages"
            "#,
        )
        .unwrap();
        ProfileLookup::from_config(&config)
    }

    fn ep(name: &str, backend_type: &str) -> Endpoint {
        Endpoint {
            name: name.into(),
            url: format!("http://{name}"),
            backend_type: backend_type.into(),
            status: HealthStatus::Healthy,
            priority: 100,
            last_checked: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            check_interval: Duration::from_secs(5),
        }
    }

    // ── to_openai ─────────────────────────────────────────────────────────

    #[test]
    fn to_openai_promotes_system_to_first_message() {
        let req = json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "system": "You are terse.",
            "messages": [{ "role": "user", "content": "Hello" }],
        });
        let out = to_openai(&req).unwrap();

        let messages = out.openai_body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are terse.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(out.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
    }

    #[test]
    fn to_openai_flattens_content_blocks() {
        let req = json!({
            "model": "m",
            "max_tokens": 16,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "part one " },
                    { "type": "text", "text": "part two" },
                ],
            }],
        });
        let out = to_openai(&req).unwrap();
        assert_eq!(out.openai_body["messages"][0]["content"], "part one part two");
    }

    #[test]
    fn to_openai_carries_sampling_parameters() {
        let req = json!({
            "model": "m",
            "max_tokens": 99,
            "temperature": 0.3,
            "top_p": 0.9,
            "stop_sequences": ["END"],
            "messages": [{ "role": "user", "content": "hi" }],
        });
        let out = to_openai(&req).unwrap();
        assert_eq!(out.openai_body["max_tokens"], 99);
        assert!((out.openai_body["temperature"].as_f64().unwrap() - 0.3).abs() < f64::EPSILON);
        assert_eq!(out.openai_body["stop"], json!(["END"]));
    }

    #[test]
    fn to_openai_reads_stream_flag() {
        let req = json!({
            "model": "m", "max_tokens": 1, "stream": true,
            "messages": [{ "role": "user", "content": "hi" }],
        });
        let out = to_openai(&req).unwrap();
        assert!(out.is_streaming);
        assert_eq!(out.openai_body["stream"], true);
    }

    #[test]
    fn to_openai_rejects_missing_model_and_messages() {
        assert!(to_openai(&json!({ "messages": [] })).is_err());
        assert!(to_openai(&json!({ "model": "m" })).is_err());
    }

    #[test]
    fn to_openai_rejects_tool_use_blocks() {
        let req = json!({
            "model": "m", "max_tokens": 1,
            "messages": [{
                "role": "assistant",
                "content": [{ "type": "tool_use", "id": "t1", "name": "calc", "input": {} }],
            }],
        });
        let err = to_openai(&req).unwrap_err();
        assert!(matches!(err, GatewayError::RequestTransform(_)));
    }

    // ── from_openai ───────────────────────────────────────────────────────

    #[test]
    fn from_openai_maps_stop_to_end_turn() {
        let resp = json!({
            "id": "chatcmpl-1",
            "model": "m",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "Hello!" },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 },
        });
        let out = from_openai(&resp, &json!({})).unwrap();

        assert_eq!(out["type"], "message");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["content"][0]["text"], "Hello!");
        assert_eq!(out["usage"]["input_tokens"], 10);
        assert_eq!(out["usage"]["output_tokens"], 5);
        assert_eq!(out["id"], "msg_chatcmpl-1");
    }

    #[test]
    fn from_openai_maps_length_to_max_tokens() {
        let resp = json!({
            "model": "m",
            "choices": [{ "message": { "content": "…" }, "finish_reason": "length" }],
        });
        let out = from_openai(&resp, &json!({})).unwrap();
        assert_eq!(out["stop_reason"], "max_tokens");
    }

    #[test]
    fn from_openai_falls_back_to_request_model() {
        let resp = json!({
            "choices": [{ "message": { "content": "x" }, "finish_reason": "stop" }],
        });
        let out = from_openai(&resp, &json!({ "model": "requested-model" })).unwrap();
        assert_eq!(out["model"], "requested-model");
    }

    #[test]
    fn from_openai_errors_without_choices() {
        assert!(from_openai(&json!({}), &json!({})).is_err());
    }

    // ── streaming ─────────────────────────────────────────────────────────

    async fn translate_stream(input: &str) -> String {
        let translator = AnthropicTranslator::new();
        let reader = tokio::io::BufReader::new(std::io::Cursor::new(input.as_bytes().to_vec()));
        let mut out: Vec<u8> = Vec::new();
        translator
            .transform_streaming_response(
                Box::new(reader),
                &mut out,
                &json!({ "model": "claude-test" }),
            )
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn streaming_emits_full_anthropic_frame_sequence() {
        let input = concat!(
            "data: {\"model\":\"claude-test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let out = translate_stream(input).await;

        let order = [
            "event: message_start",
            "event: content_block_start",
            "event: content_block_delta",
            "event: content_block_stop",
            "event: message_delta",
            "event: message_stop",
        ];
        let mut last = 0;
        for marker in order {
            let pos = out.find(marker).unwrap_or_else(|| panic!("missing `{marker}`"));
            assert!(pos >= last, "`{marker}` out of order");
            last = pos;
        }
        assert!(out.contains(r#""text":"Hel""#));
        assert!(out.contains(r#""text":"lo""#));
        assert!(out.contains(r#""stop_reason":"end_turn""#));
        assert!(out.contains(r#""output_tokens":2"#));
    }

    #[tokio::test]
    async fn streaming_without_done_still_closes_the_sequence() {
        let input =
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"},\"finish_reason\":null}]}\n\n";
        let out = translate_stream(input).await;
        assert!(out.contains("event: message_stop"));
    }

    #[tokio::test]
    async fn streaming_skips_malformed_chunks_and_keepalives() {
        let input = concat!(
            ": keep-alive\n\n",
            "data: {not json}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let out = translate_stream(input).await;
        assert!(out.contains(r#""text":"ok""#));
        assert!(out.contains("event: message_stop"));
    }

    #[tokio::test]
    async fn empty_stream_yields_wellformed_empty_message() {
        let out = translate_stream("").await;
        assert!(out.contains("event: message_start"));
        assert!(out.contains("event: message_stop"));
        assert!(!out.contains("content_block_delta"));
    }

    // ── passthrough capability ────────────────────────────────────────────

    #[test]
    fn can_passthrough_requires_every_endpoint_to_support_dialect() {
        let t = AnthropicTranslator::new();
        let profiles = profiles();

        assert!(t.can_passthrough(&[ep("v1", "vllm")], &profiles));
        assert!(t.can_passthrough(&[ep("v1", "vllm"), ep("v2", "vllm")], &profiles));
        assert!(!t.can_passthrough(&[ep("v1", "vllm"), ep("o1", "ollama")], &profiles));
        assert!(!t.can_passthrough(&[], &profiles));
        assert!(!t.can_passthrough(&[ep("x", "unknown-type")], &profiles));
    }

    #[test]
    fn prepare_passthrough_keeps_bytes_and_extracts_routing_facts() {
        let t = AnthropicTranslator::new();
        let profiles = profiles();
        let body = Bytes::from_static(
            br#"{"model":"claude-3-5-sonnet-20241022","max_tokens":1024,"stream":true,"messages":[]}"#,
        );

        let plan = t.prepare_passthrough(&body, &profiles, &[ep("v1", "vllm")]).unwrap();
        assert_eq!(plan.body, body, "passthrough must preserve bytes exactly");
        assert_eq!(plan.target_path, "/v1/messages");
        assert_eq!(plan.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
        assert!(plan.is_streaming);
    }

    #[test]
    fn prepare_passthrough_rejects_malformed_json() {
        let t = AnthropicTranslator::new();
        let err = t
            .prepare_passthrough(&Bytes::from_static(b"{nope"), &profiles(), &[ep("v1", "vllm")])
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadInput(_)));
    }

    // ── error writer ──────────────────────────────────────────────────────

    #[test]
    fn error_body_uses_native_schema() {
        let t = AnthropicTranslator::new();
        let body =
            t.error_body(StatusCode::BAD_REQUEST, "invalid_request_error", "Invalid model");
        assert_eq!(
            body,
            json!({
                "type": "error",
                "error": { "type": "invalid_request_error", "message": "Invalid model" }
            })
        );
    }

    #[test]
    fn error_body_derives_type_from_status_when_unspecified() {
        let t = AnthropicTranslator::new();
        assert_eq!(
            t.error_body(StatusCode::SERVICE_UNAVAILABLE, "", "down")["error"]["type"],
            "api_error"
        );
        assert_eq!(
            t.error_body(StatusCode::TOO_MANY_REQUESTS, "", "slow")["error"]["type"],
            "rate_limit_error"
        );
        assert_eq!(
            t.error_body(StatusCode::PAYLOAD_TOO_LARGE, "", "big")["error"]["type"],
            "request_too_large"
        );
    }

    // ── token counting ────────────────────────────────────────────────────

    #[test]
    fn count_tokens_counts_system_and_messages() {
        let t = AnthropicTranslator::new();
        let body = serde_json::to_vec(&json!({
            "model": "m",
            "system": "You are a helpful assistant.",
            "messages": [{ "role": "user", "content": "How do Rust lifetimes work?" }],
        }))
        .unwrap();

        let counted = t.count_tokens(&body).unwrap();
        let n = counted["input_tokens"].as_u64().unwrap();
        assert!(n > 5, "expected a plausible token count, got {n}");
    }

    #[test]
    fn count_tokens_requires_messages() {
        let t = AnthropicTranslator::new();
        assert!(t.count_tokens(br#"{"model":"m"}"#).is_err());
    }
}
