//! Request ID middleware.
//!
//! Every inbound request is assigned a unique `X-Olla-Request-Id`. The ID is:
//!
//! - Accepted from the caller if they already provide `X-Olla-Request-Id`
//! - Freshly generated (UUID v4) otherwise
//! - Stored as an axum [`Extension`] so handlers can read it
//! - Echoed back in the `X-Olla-Request-Id` response header
//! - Wrapped in a [`tracing`] span so every log line for the request includes it
//!
//! This ties the stats view (`/internal/stats/*`), server logs, and the
//! client response together through a single identifier.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::headers;

/// Newtype wrapper carrying the assigned request ID.
///
/// Exposed as an axum [`Extension`] so any handler can read it:
/// ```rust,ignore
/// async fn handler(Extension(req_id): Extension<RequestId>) { ... }
/// ```
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Axum middleware that assigns a [`RequestId`] to every request.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(headers::REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    // Wrap the downstream handler in a span so every log line includes the ID.
    let span = tracing::debug_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if !response.headers().contains_key(headers::REQUEST_ID) {
        if let Ok(header_value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(headers::REQUEST_ID, header_value);
        }
    }

    response
}
