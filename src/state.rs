//! Shared application state injected into every request handler.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::endpoint::EndpointRepository;
use crate::profile::ProfileLookup;
use crate::proxy::ProxyService;
use crate::registry::ModelRegistry;
use crate::stats::EventLog;
use crate::translator::TranslatorRegistry;

/// Everything the handlers need, behind `Arc` so cloning is cheap.
///
/// No global mutable state lives in the pipeline: the repository, registry,
/// proxy and sink are injected here once at startup and handlers keep only
/// per-request values on the stack.
pub struct AppState {
    pub config: Arc<Config>,
    pub profiles: ProfileLookup,
    pub endpoints: Arc<dyn EndpointRepository>,
    pub registry: Arc<dyn ModelRegistry>,
    pub proxy: Arc<dyn ProxyService>,
    pub translators: Arc<TranslatorRegistry>,
    pub events: Arc<EventLog>,
    /// Gateway start time, for uptime reporting.
    pub started_at: Instant,
}
