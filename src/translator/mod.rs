//! Dialect translators and their capability surface.
//!
//! A [`Translator`] converts one client dialect to and from the canonical
//! OpenAI chat-completions shape. Translators are process-wide, stateless
//! per request, and created once at startup.
//!
//! Optional powers — passthrough, native error formatting, token counting,
//! a custom route path, a body-size limit — are modelled as small named
//! capability traits probed at request time through `Option`-returning
//! methods, never through inheritance. A translator that returns `None`
//! simply does not have that power and the pipeline degrades accordingly.

mod anthropic;

pub use anthropic::AnthropicTranslator;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::GatewayError;
use crate::profile::{Dialect, ProfileLookup};

/// Body-size ceiling applied when a translator declares no limit of its own.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// A native-dialect request re-expressed in the canonical OpenAI shape.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub openai_body: Value,
    pub model: Option<String>,
    pub is_streaming: bool,
    /// Upstream path override; `None` means `/v1/chat/completions`.
    pub target_path: Option<String>,
}

impl TransformedRequest {
    pub fn target_path(&self) -> &str {
        self.target_path.as_deref().unwrap_or("/v1/chat/completions")
    }
}

/// A request prepared for byte-identical forwarding.
#[derive(Debug, Clone)]
pub struct PassthroughPlan {
    pub body: Bytes,
    pub target_path: String,
    pub model: Option<String>,
    pub is_streaming: bool,
}

/// Capability: forward the client's bytes unchanged when every candidate
/// endpoint natively speaks the translator's dialect.
pub trait PassthroughCapable: Send + Sync {
    /// Must return true only when **every** endpoint in `endpoints`
    /// natively supports this translator's dialect per the profile lookup.
    fn can_passthrough(&self, endpoints: &[Endpoint], profiles: &ProfileLookup) -> bool;

    fn prepare_passthrough(
        &self,
        body: &Bytes,
        profiles: &ProfileLookup,
        endpoints: &[Endpoint],
    ) -> Result<PassthroughPlan, GatewayError>;
}

/// Capability: render errors in the dialect's native error schema.
pub trait ErrorWriter: Send + Sync {
    fn error_body(&self, status: StatusCode, error_type: &str, message: &str) -> Value;
}

/// Capability: serve the dialect's token-counting endpoint.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, body: &[u8]) -> Result<Value, GatewayError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    /// Parse the native dialect and emit a canonical OpenAI request.
    fn transform_request(&self, body: &[u8]) -> Result<TransformedRequest, GatewayError>;

    /// Convert a buffered OpenAI response back into the native dialect.
    fn transform_response(
        &self,
        openai: &Value,
        original: &Value,
    ) -> Result<Value, GatewayError>;

    /// Consume an OpenAI SSE stream from `upstream` and write native SSE to
    /// `out`. Returns once the stream is fully drained or an error occurs.
    async fn transform_streaming_response(
        &self,
        upstream: Box<dyn AsyncBufRead + Send + Unpin>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        original: &Value,
    ) -> Result<(), GatewayError>;

    // ── Capability probes ────────────────────────────────────────────────

    fn passthrough(&self) -> Option<&dyn PassthroughCapable> {
        None
    }

    fn error_writer(&self) -> Option<&dyn ErrorWriter> {
        None
    }

    fn token_counter(&self) -> Option<&dyn TokenCounter> {
        None
    }

    /// Declared request body ceiling; `None` ⇒ [`DEFAULT_MAX_BODY_SIZE`].
    fn max_body_size(&self) -> Option<usize> {
        None
    }

    /// Route path the translator wants registered for itself, when it
    /// deviates from the dialect default.
    fn route_path(&self) -> Option<&'static str> {
        None
    }
}

/// The effective body limit for a translator: its own declaration capped by
/// any per-translator config override (the override can only lower it).
pub fn effective_body_limit(translator: &dyn Translator, configured: Option<usize>) -> usize {
    let declared = translator.max_body_size().unwrap_or(DEFAULT_MAX_BODY_SIZE);
    match configured {
        Some(limit) => declared.min(limit),
        None => declared,
    }
}

/// Process-wide translator registry, keyed by translator name.
#[derive(Default)]
pub struct TranslatorRegistry {
    by_name: HashMap<&'static str, Arc<dyn Translator>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config: known translators are constructed
    /// only when enabled.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        if config.translator("anthropic").is_some() {
            registry.register(Arc::new(AnthropicTranslator::new()));
        }
        registry
    }

    pub fn register(&mut self, translator: Arc<dyn Translator>) {
        self.by_name.insert(translator.name(), translator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Translator>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
