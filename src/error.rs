//! Unified error type for the request pipeline.
//!
//! [`GatewayError`] carries the error taxonomy the pipeline reasons about:
//! each variant maps to one client-visible status code, so handlers can
//! return `Result<T, GatewayError>` and propagate with `?`. The
//! [`IntoResponse`] impl renders the generic JSON envelope
//! `{"error":{"message","type"}}`; translator handlers intercept the error
//! before this point when the translator has its own error schema.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed body, unknown provider, or a missing required field.
    #[error("{0}")]
    BadInput(String),

    /// Request body exceeds the declared limit.
    #[error("request body exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    /// No healthy endpoint speaks the request's dialect.
    #[error("no compatible healthy endpoint for this request")]
    NoCompatibleEndpoint,

    /// A model was named but no healthy endpoint hosts it.
    #[error("model `{0}` is not available on any healthy endpoint")]
    ModelNotAvailable(String),

    /// The proxy failed before any response byte reached the client.
    #[error("upstream request failed: {0}")]
    UpstreamFailure(String),

    /// The backend answered with an error body; status is preserved.
    #[error("upstream returned {status}: {message}")]
    UpstreamErrorResponse {
        status: u16,
        message: String,
        error_type: Option<String>,
        param: Option<String>,
        code: Option<String>,
    },

    /// The translator could not convert the client request.
    #[error("could not translate request: {0}")]
    RequestTransform(String),

    /// The translator could not convert the backend response.
    #[error("could not translate response: {0}")]
    ResponseTransform(String),

    /// Error after response headers were flushed; the stream is truncated.
    #[error("stream failed after headers were sent: {0}")]
    StreamFailure(String),
}

impl GatewayError {
    /// The status code this error renders as when it reaches the client
    /// before any response byte has been written.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadInput(_) | Self::RequestTransform(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoCompatibleEndpoint => StatusCode::SERVICE_UNAVAILABLE,
            Self::ModelNotAvailable(_) => StatusCode::NOT_FOUND,
            Self::UpstreamFailure(_)
            | Self::ResponseTransform(_)
            | Self::StreamFailure(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamErrorResponse { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Stable machine-readable kind string, used in the generic envelope
    /// and in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "bad_input",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NoCompatibleEndpoint => "no_compatible_endpoint",
            Self::ModelNotAvailable(_) => "model_not_available",
            Self::UpstreamFailure(_) => "upstream_failure",
            Self::UpstreamErrorResponse { .. } => "upstream_error",
            Self::RequestTransform(_) => "request_transform_failure",
            Self::ResponseTransform(_) => "response_transform_failure",
            Self::StreamFailure(_) => "stream_failure",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind(), error = %self, "request failed");
        (
            self.status(),
            Json(json!({ "error": { "message": self.to_string(), "type": self.kind() } })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(GatewayError::BadInput("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::PayloadTooLarge { limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::NoCompatibleEndpoint.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::ModelNotAvailable("m".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::UpstreamFailure("boom".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::RequestTransform("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ResponseTransform("bad".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn upstream_error_response_preserves_status() {
        let err = GatewayError::UpstreamErrorResponse {
            status: 429,
            message: "slow down".into(),
            error_type: Some("rate_limit_error".into()),
            param: None,
            code: None,
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn upstream_error_with_invalid_status_falls_back_to_502() {
        let err = GatewayError::UpstreamErrorResponse {
            status: 99,
            message: "?".into(),
            error_type: None,
            param: None,
            code: None,
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
