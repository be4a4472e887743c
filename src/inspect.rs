//! Request profiling — the inspector chain.
//!
//! Before anything is forwarded, a chain of inspectors runs over the
//! request and produces a [`RequestProfile`]: observed path, extracted model
//! name, detected dialect, and the set of backend types that natively speak
//! that dialect. The body is read once into a buffer by the handler; every
//! inspector peeks the same buffer, so downstream stages always see the
//! full body.
//!
//! Profiles are frozen after the chain runs — routing never mutates them.

use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::Value;

use crate::error::GatewayError;
use crate::profile::{Dialect, ProfileLookup};

/// Immutable per-request routing profile produced by the chain.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    /// The path as observed on the wire, before prefix stripping.
    pub path: String,
    /// Model name extracted from the body, when present.
    pub model: Option<String>,
    pub dialect: Dialect,
    /// Backend types whose profiles natively speak `dialect`.
    pub supported_by: Vec<String>,
    /// Whether the body requested a streaming response.
    pub is_streaming: bool,
}

/// Mutable working state threaded through the chain.
#[derive(Debug, Default)]
struct Draft {
    model: Option<String>,
    dialect: Option<Dialect>,
    is_streaming: bool,
}

/// What an inspector gets to look at. The body buffer is shared, never
/// consumed.
pub struct Inspection<'a> {
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a Bytes,
}

trait Inspector: Send + Sync {
    fn inspect(&self, req: &Inspection<'_>, draft: &mut Draft) -> Result<(), GatewayError>;
}

/// Derives an initial dialect guess from the path alone.
struct PathInspector;

impl Inspector for PathInspector {
    fn inspect(&self, req: &Inspection<'_>, draft: &mut Draft) -> Result<(), GatewayError> {
        let dialect = if req.path.ends_with("/v1/messages")
            || req.path.ends_with("/v1/messages/count_tokens")
        {
            Some(Dialect::Anthropic)
        } else if req.path.ends_with("/v1/chat/completions")
            || req.path.ends_with("/v1/completions")
            || req.path.ends_with("/v1/embeddings")
        {
            Some(Dialect::OpenAI)
        } else if req.path.ends_with("/api/chat") || req.path.ends_with("/api/generate") {
            Some(Dialect::Ollama)
        } else {
            None
        };

        if let Some(d) = dialect {
            draft.dialect = Some(d);
        }
        Ok(())
    }
}

/// Parses the JSON body: extracts `model`, `stream`, and dialect indicators.
///
/// In strict mode a non-empty body that fails to parse is a `bad-input`
/// error; in lenient mode (generic forwards, where bodies may not be JSON
/// at all) it is ignored.
struct BodyInspector {
    strict: bool,
}

impl Inspector for BodyInspector {
    fn inspect(&self, req: &Inspection<'_>, draft: &mut Draft) -> Result<(), GatewayError> {
        if req.body.is_empty() {
            return Ok(());
        }

        let json: Value = match serde_json::from_slice(req.body) {
            Ok(v) => v,
            Err(e) if self.strict => {
                return Err(GatewayError::BadInput(format!("request body is not valid JSON: {e}")));
            }
            Err(_) => return Ok(()),
        };

        if let Some(model) = json.get("model").and_then(Value::as_str) {
            if !model.is_empty() {
                draft.model = Some(model.to_string());
            }
        }
        draft.is_streaming = json.get("stream").and_then(Value::as_bool).unwrap_or(false);

        // The Anthropic Messages shape: required max_tokens plus a messages
        // array. Only refine the guess when the path gave us nothing firmer.
        if draft.dialect.is_none()
            && json.get("max_tokens").is_some()
            && json.get("messages").map(Value::is_array).unwrap_or(false)
            && (json.get("system").is_some() || json.get("anthropic_version").is_some())
        {
            draft.dialect = Some(Dialect::Anthropic);
        }

        Ok(())
    }
}

/// The configured chain. Currently path inspection followed by body
/// inspection, matching the order the data becomes trustworthy in.
pub struct InspectorChain {
    inspectors: Vec<Box<dyn Inspector>>,
}

impl InspectorChain {
    /// Chain for translator endpoints: malformed JSON is rejected.
    pub fn strict() -> Self {
        Self {
            inspectors: vec![Box::new(PathInspector), Box::new(BodyInspector { strict: true })],
        }
    }

    /// Chain for generic provider forwards: bodies may be anything.
    pub fn lenient() -> Self {
        Self {
            inspectors: vec![Box::new(PathInspector), Box::new(BodyInspector { strict: false })],
        }
    }

    /// Run every inspector and freeze the result.
    ///
    /// `fallback` is the dialect assumed when neither path nor body gives
    /// one away — the caller knows what surface the request arrived on.
    pub fn profile(
        &self,
        req: &Inspection<'_>,
        fallback: Dialect,
        profiles: &ProfileLookup,
    ) -> Result<RequestProfile, GatewayError> {
        let mut draft = Draft::default();
        for inspector in &self.inspectors {
            inspector.inspect(req, &mut draft)?;
        }

        let dialect = draft.dialect.unwrap_or(fallback);
        Ok(RequestProfile {
            path: req.path.to_string(),
            model: draft.model,
            dialect,
            supported_by: profiles.types_supporting(dialect),
            is_streaming: draft.is_streaming,
        })
    }
}
