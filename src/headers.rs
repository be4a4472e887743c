//! The `X-Olla-*` observability header family.
//!
//! Routing outcomes travel to the client as response headers so any HTTP
//! client can see which backend served it and why, without scraping logs.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

pub const REQUEST_ID: &str = "x-olla-request-id";
pub const ENDPOINT: &str = "x-olla-endpoint";
pub const BACKEND_TYPE: &str = "x-olla-backend-type";
pub const MODEL: &str = "x-olla-model";
pub const RESPONSE_TIME: &str = "x-olla-response-time";
pub const ROUTING_STRATEGY: &str = "x-olla-routing-strategy";
pub const ROUTING_DECISION: &str = "x-olla-routing-decision";
pub const ROUTING_REASON: &str = "x-olla-routing-reason";
/// Present only when the request was passed through untranslated.
pub const MODE: &str = "x-olla-mode";

/// The headers copied from a recorder to the client response.
pub const OBSERVABILITY: &[&str] = &[
    REQUEST_ID,
    ENDPOINT,
    BACKEND_TYPE,
    MODEL,
    RESPONSE_TIME,
    ROUTING_STRATEGY,
    ROUTING_DECISION,
    ROUTING_REASON,
    MODE,
];

/// Insert a string value, silently skipping values that are not valid
/// header bytes (endpoint names come from config and may be anything).
pub fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Copy the observability set from `recorded` into `out`. Unset headers are
/// skipped; `X-Olla-Model` is backfilled from `model` when the recorder
/// (i.e. the backend) did not set it.
pub fn copy_observability(recorded: &HeaderMap, out: &mut HeaderMap, model: Option<&str>) {
    for name in OBSERVABILITY {
        if let Some(value) = recorded.get(*name) {
            out.insert(HeaderName::from_static(*name), value.clone());
        }
    }
    if !out.contains_key(MODEL) {
        if let Some(model) = model {
            insert_str(out, MODEL, model);
        }
    }
}
