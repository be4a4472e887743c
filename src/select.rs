//! Endpoint selection.
//!
//! Given a frozen request profile and the current healthy fleet, pick the
//! candidates a request may be proxied to, and record why. Tie-breaking
//! among candidates is delegated to the proxy service — the returned order
//! (priority-descending) is advisory.

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::GatewayError;
use crate::inspect::RequestProfile;
use crate::registry::ModelRegistry;

/// Why the candidate set was chosen. Surfaced in `X-Olla-Routing-Reason`
/// and the per-request metrics event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// Candidates host the requested model.
    ModelMatch,
    /// Model unknown (or not yet discovered); candidates merely speak the
    /// request's dialect.
    DialectMatch,
    /// No model constraint applied; any healthy endpoint of the family.
    FallbackAnyHealthy,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelMatch => "model-match",
            Self::DialectMatch => "dialect-match",
            Self::FallbackAnyHealthy => "fallback-any-healthy",
        }
    }
}

/// The record routing leaves behind: strategy, chosen endpoint (filled in
/// once the proxy commits to one), and the reason code.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub strategy: &'static str,
    pub endpoint: Option<String>,
    pub reason: RouteReason,
}

impl RoutingDecision {
    fn new(reason: RouteReason) -> Self {
        Self { strategy: "priority", endpoint: None, reason }
    }
}

/// A non-empty, priority-ordered candidate list plus its decision record.
#[derive(Debug)]
pub struct Selection {
    pub endpoints: Vec<Endpoint>,
    pub decision: RoutingDecision,
}

fn order(mut endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    endpoints.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
    endpoints
}

/// Narrow `candidates` to those hosting `model` according to the registry.
///
/// An empty intersection falls back to the full candidate set — the model
/// may be reachable after the next registry refresh, and failing hard here
/// would turn discovery lag into client-visible 404s.
fn narrow_by_model(
    candidates: Vec<Endpoint>,
    model: Option<&str>,
    registry: &dyn ModelRegistry,
    broad_reason: RouteReason,
) -> (Vec<Endpoint>, RouteReason) {
    let Some(model) = model else {
        return (candidates, broad_reason);
    };

    let hosting = registry.endpoints_for_model(model);
    let matched: Vec<Endpoint> = candidates
        .iter()
        .filter(|e| hosting.contains(&e.url))
        .cloned()
        .collect();

    if matched.is_empty() {
        debug!(%model, "no candidate hosts the model yet, falling back to dialect set");
        (candidates, broad_reason)
    } else {
        (matched, RouteReason::ModelMatch)
    }
}

/// Select candidates for a dialect-routed (translator) request.
pub fn by_dialect(
    profile: &RequestProfile,
    healthy: Vec<Endpoint>,
    registry: &dyn ModelRegistry,
) -> Result<Selection, GatewayError> {
    let dialect_set: Vec<Endpoint> = healthy
        .into_iter()
        .filter(|e| profile.supported_by.iter().any(|t| *t == e.backend_type))
        .collect();

    if dialect_set.is_empty() {
        return Err(GatewayError::NoCompatibleEndpoint);
    }

    let (endpoints, reason) = narrow_by_model(
        dialect_set,
        profile.model.as_deref(),
        registry,
        RouteReason::DialectMatch,
    );

    Ok(Selection { endpoints: order(endpoints), decision: RoutingDecision::new(reason) })
}

/// Select candidates for a provider-prefixed forward (`/olla/{provider}/…`).
pub fn by_backend_type(
    backend_type: &str,
    model: Option<&str>,
    healthy: Vec<Endpoint>,
    registry: &dyn ModelRegistry,
) -> Result<Selection, GatewayError> {
    let typed: Vec<Endpoint> =
        healthy.into_iter().filter(|e| e.backend_type == backend_type).collect();

    if typed.is_empty() {
        return Err(GatewayError::NoCompatibleEndpoint);
    }

    let (endpoints, reason) =
        narrow_by_model(typed, model, registry, RouteReason::FallbackAnyHealthy);

    Ok(Selection { endpoints: order(endpoints), decision: RoutingDecision::new(reason) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HealthStatus;
    use crate::profile::Dialect;
    use std::time::Duration;

    struct FakeRegistry {
        hosting: Vec<String>,
    }

    impl ModelRegistry for FakeRegistry {
        fn endpoints_for_model(&self, _model: &str) -> Vec<String> {
            self.hosting.clone()
        }
        fn unified_models(&self) -> Vec<crate::registry::UnifiedModel> {
            Vec::new()
        }
    }

    fn ep(name: &str, backend_type: &str, priority: u32) -> Endpoint {
        Endpoint {
            name: name.into(),
            url: format!("http://{name}"),
            backend_type: backend_type.into(),
            status: HealthStatus::Healthy,
            priority,
            last_checked: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            check_interval: Duration::from_secs(5),
        }
    }

    fn anthropic_profile(model: Option<&str>) -> RequestProfile {
        RequestProfile {
            path: "/v1/messages".into(),
            model: model.map(str::to_string),
            dialect: Dialect::Anthropic,
            supported_by: vec!["vllm".into()],
            is_streaming: false,
        }
    }

    #[test]
    fn dialect_filter_keeps_only_supporting_types() {
        let registry = FakeRegistry { hosting: vec![] };
        let healthy = vec![ep("v1", "vllm", 100), ep("o1", "ollama", 100)];

        let sel = by_dialect(&anthropic_profile(None), healthy, &registry).unwrap();
        assert_eq!(sel.endpoints.len(), 1);
        assert_eq!(sel.endpoints[0].name, "v1");
        assert_eq!(sel.decision.reason, RouteReason::DialectMatch);
    }

    #[test]
    fn empty_dialect_set_is_no_compatible_endpoint() {
        let registry = FakeRegistry { hosting: vec![] };
        let healthy = vec![ep("o1", "ollama", 100)];

        let err = by_dialect(&anthropic_profile(None), healthy, &registry).unwrap_err();
        assert!(matches!(err, GatewayError::NoCompatibleEndpoint));
    }

    #[test]
    fn model_intersection_narrows_candidates() {
        let registry = FakeRegistry { hosting: vec!["http://v2".into()] };
        let healthy = vec![ep("v1", "vllm", 100), ep("v2", "vllm", 50)];

        let sel =
            by_dialect(&anthropic_profile(Some("claude-x")), healthy, &registry).unwrap();
        assert_eq!(sel.endpoints.len(), 1);
        assert_eq!(sel.endpoints[0].name, "v2");
        assert_eq!(sel.decision.reason, RouteReason::ModelMatch);
    }

    #[test]
    fn empty_model_intersection_falls_back_to_dialect_set() {
        let registry = FakeRegistry { hosting: vec!["http://elsewhere".into()] };
        let healthy = vec![ep("v1", "vllm", 100), ep("v2", "vllm", 50)];

        let sel =
            by_dialect(&anthropic_profile(Some("claude-x")), healthy, &registry).unwrap();
        assert_eq!(sel.endpoints.len(), 2);
        assert_eq!(sel.decision.reason, RouteReason::DialectMatch);
    }

    #[test]
    fn candidates_are_priority_descending() {
        let registry = FakeRegistry { hosting: vec![] };
        let healthy = vec![ep("low", "vllm", 10), ep("high", "vllm", 200), ep("mid", "vllm", 100)];

        let sel = by_dialect(&anthropic_profile(None), healthy, &registry).unwrap();
        let names: Vec<&str> = sel.endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[test]
    fn by_backend_type_without_model_is_fallback_any_healthy() {
        let registry = FakeRegistry { hosting: vec![] };
        let healthy = vec![ep("o1", "ollama", 100), ep("v1", "vllm", 100)];

        let sel = by_backend_type("ollama", None, healthy, &registry).unwrap();
        assert_eq!(sel.endpoints.len(), 1);
        assert_eq!(sel.decision.reason, RouteReason::FallbackAnyHealthy);
    }

    #[test]
    fn by_backend_type_with_hosted_model_is_model_match() {
        let registry = FakeRegistry { hosting: vec!["http://o1".into()] };
        let healthy = vec![ep("o1", "ollama", 100), ep("o2", "ollama", 100)];

        let sel = by_backend_type("ollama", Some("llama3.1"), healthy, &registry).unwrap();
        assert_eq!(sel.endpoints.len(), 1);
        assert_eq!(sel.decision.reason, RouteReason::ModelMatch);
    }

    #[test]
    fn by_backend_type_with_no_endpoints_of_type_fails() {
        let registry = FakeRegistry { hosting: vec![] };
        let err = by_backend_type("vllm", None, vec![ep("o1", "ollama", 100)], &registry)
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoCompatibleEndpoint));
    }
}
