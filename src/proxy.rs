//! Byte-level forwarding to upstream endpoints.
//!
//! The pipeline consumes [`ProxyService`]: hand it a prepared upstream
//! request, a non-empty candidate list, and a [`ResponseSink`], and it
//! commits to one endpoint, writes the upstream head and body into the
//! sink, and reports which endpoint served. Everything above this seam is
//! transport-agnostic; the executors only ever see sinks and outcomes.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt as _;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::GatewayError;
use crate::headers;

/// A request prepared for forwarding: prefix already stripped, body already
/// in its final (possibly translated) form. The extracted model name rides
/// the call explicitly so the proxy never re-parses the body.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path + query sent to the endpoint, starting with `/`.
    pub target_path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: Option<String>,
    pub is_streaming: bool,
}

/// Where the proxy writes the upstream response.
///
/// `write_head` is called exactly once, before any body byte; the sink may
/// buffer or stream as it pleases. An `Err` from either method aborts the
/// forward (the usual cause is the client going away).
#[async_trait]
pub trait ResponseSink: Send {
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> std::io::Result<()>;
    async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()>;
}

/// What the proxy committed to and how the upstream answered.
#[derive(Debug, Clone)]
pub struct ProxyOutcome {
    pub endpoint_name: String,
    pub backend_type: String,
    pub status: StatusCode,
}

#[async_trait]
pub trait ProxyService: Send + Sync {
    /// Forward `req` to one of `endpoints` (tried in the given order) and
    /// stream the response into `sink`.
    ///
    /// Connection failures before any response byte fail over to the next
    /// candidate; once a response head has been obtained the proxy is
    /// committed and later failures surface as stream errors.
    async fn forward(
        &self,
        req: UpstreamRequest,
        endpoints: &[Endpoint],
        sink: &mut dyn ResponseSink,
    ) -> Result<ProxyOutcome, GatewayError>;
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || lower == "host" || lower == "content-length" {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

/// reqwest-backed reverse proxy.
pub struct ReverseProxy {
    /// Buffered requests — carries the configured request timeout.
    client: reqwest::Client,
    /// Streaming requests — no request-level timeout (body arrives
    /// incrementally). TCP connect timeout still applies.
    stream_client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new(timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, stream_client })
    }
}

#[async_trait]
impl ProxyService for ReverseProxy {
    async fn forward(
        &self,
        req: UpstreamRequest,
        endpoints: &[Endpoint],
        sink: &mut dyn ResponseSink,
    ) -> Result<ProxyOutcome, GatewayError> {
        debug_assert!(!endpoints.is_empty(), "selector must hand over a non-empty list");

        let client = if req.is_streaming { &self.stream_client } else { &self.client };
        let forward_headers = strip_hop_by_hop(&req.headers);

        let mut last_error: Option<String> = None;

        for endpoint in endpoints {
            let url = format!("{}{}", endpoint.url, req.target_path);

            let mut builder = client
                .request(req.method.clone(), &url)
                .headers(forward_headers.clone());
            if !req.body.is_empty() {
                builder = builder.body(req.body.clone());
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "endpoint unreachable, trying next");
                    last_error = Some(format!("{}: {e}", endpoint.name));
                    continue;
                }
            };

            // Committed: a response head exists, no more failover.
            let status = response.status();
            let mut head = strip_hop_by_hop(response.headers());
            headers::insert_str(&mut head, headers::ENDPOINT, &endpoint.name);
            headers::insert_str(&mut head, headers::BACKEND_TYPE, &endpoint.backend_type);

            sink.write_head(status, &head)
                .await
                .map_err(|e| GatewayError::StreamFailure(e.to_string()))?;

            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk
                    .map_err(|e| GatewayError::StreamFailure(format!("reading upstream: {e}")))?;
                sink.write_body(chunk)
                    .await
                    .map_err(|e| GatewayError::StreamFailure(e.to_string()))?;
            }

            debug!(endpoint = %endpoint.name, %status, path = %req.target_path, "forward complete");
            return Ok(ProxyOutcome {
                endpoint_name: endpoint.name.clone(),
                backend_type: endpoint.backend_type.clone(),
                status,
            });
        }

        Err(GatewayError::UpstreamFailure(
            last_error.unwrap_or_else(|| "no endpoint accepted the connection".into()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HealthStatus;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Sink that buffers everything, for assertions.
    #[derive(Default)]
    struct TestSink {
        status: Option<StatusCode>,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    #[async_trait]
    impl ResponseSink for TestSink {
        async fn write_head(
            &mut self,
            status: StatusCode,
            headers: &HeaderMap,
        ) -> std::io::Result<()> {
            self.status = Some(status);
            self.headers = headers.clone();
            Ok(())
        }

        async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()> {
            self.body.extend_from_slice(&chunk);
            Ok(())
        }
    }

    fn endpoint(name: &str, url: &str) -> Endpoint {
        Endpoint {
            name: name.into(),
            url: url.trim_end_matches('/').into(),
            backend_type: "vllm".into(),
            status: HealthStatus::Healthy,
            priority: 100,
            last_checked: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            check_interval: Duration::from_secs(5),
        }
    }

    fn post(path: &str, body: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::POST,
            target_path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
            model: None,
            is_streaming: false,
        }
    }

    #[tokio::test]
    async fn forwards_body_bytes_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_string(r#"{"model":"m","max_tokens":1,"messages":[]}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .mount(&server)
            .await;

        let proxy = ReverseProxy::new(5_000).unwrap();
        let mut sink = TestSink::default();
        let outcome = proxy
            .forward(
                post("/v1/messages", r#"{"model":"m","max_tokens":1,"messages":[]}"#),
                &[endpoint("e1", &server.uri())],
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.endpoint_name, "e1");
        assert_eq!(sink.status, Some(StatusCode::OK));
        assert_eq!(sink.body, br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn head_carries_endpoint_identity_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let proxy = ReverseProxy::new(5_000).unwrap();
        let mut sink = TestSink::default();
        proxy
            .forward(post("/x", ""), &[endpoint("gpu-box", &server.uri())], &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.headers.get(headers::ENDPOINT).unwrap(), "gpu-box");
        assert_eq!(sink.headers.get(headers::BACKEND_TYPE).unwrap(), "vllm");
    }

    #[tokio::test]
    async fn fails_over_to_next_endpoint_when_first_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("second"))
            .mount(&server)
            .await;

        let proxy = ReverseProxy::new(5_000).unwrap();
        let mut sink = TestSink::default();
        let outcome = proxy
            .forward(
                post("/x", ""),
                &[endpoint("dead", "http://127.0.0.1:1"), endpoint("live", &server.uri())],
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome.endpoint_name, "live");
        assert_eq!(sink.body, b"second");
    }

    #[tokio::test]
    async fn all_unreachable_is_upstream_failure() {
        let proxy = ReverseProxy::new(5_000).unwrap();
        let mut sink = TestSink::default();
        let err = proxy
            .forward(post("/x", ""), &[endpoint("dead", "http://127.0.0.1:1")], &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamFailure(_)));
        assert!(sink.status.is_none(), "no head must be written on total failure");
    }

    #[tokio::test]
    async fn upstream_error_status_is_committed_not_failed_over() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        let fallback = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&fallback)
            .await;

        let proxy = ReverseProxy::new(5_000).unwrap();
        let mut sink = TestSink::default();
        let outcome = proxy
            .forward(
                post("/x", ""),
                &[endpoint("first", &server.uri()), endpoint("second", &fallback.uri())],
                &mut sink,
            )
            .await
            .unwrap();

        // A served 503 is a committed response, not a connection failure.
        assert_eq!(outcome.endpoint_name, "first");
        assert_eq!(sink.status, Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn request_headers_are_forwarded_minus_hop_by_hop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut req = post("/x", "");
        req.headers.insert("x-api-key", "secret".parse().unwrap());
        req.headers.insert("connection", "keep-alive".parse().unwrap());

        let proxy = ReverseProxy::new(5_000).unwrap();
        let mut sink = TestSink::default();
        // Mounting matched on x-api-key; forward succeeding proves it went through.
        let outcome =
            proxy.forward(req, &[endpoint("e1", &server.uri())], &mut sink).await.unwrap();
        assert_eq!(outcome.status, StatusCode::OK);
    }
}
