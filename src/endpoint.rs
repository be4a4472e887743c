//! Endpoint inventory and health state.
//!
//! Endpoints are seeded from config and mutated only by the health monitor;
//! the request pipeline sees them as read-only snapshots taken per request.
//! [`EndpointRepository`] is the seam the pipeline consumes — routing code
//! never touches the concrete store.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::profile::ProfileLookup;

/// Consecutive failures before an endpoint is marked unhealthy.
const UNHEALTHY_AFTER: u32 = 3;
/// Consecutive failures before an endpoint is marked offline.
const OFFLINE_AFTER: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Offline,
}

/// Read-only snapshot of one inference endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub backend_type: String,
    pub status: HealthStatus,
    pub priority: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub check_interval: Duration,
}

impl Endpoint {
    fn from_config(cfg: &EndpointConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            url: cfg.url.trim_end_matches('/').to_string(),
            backend_type: cfg.backend_type.clone(),
            // New endpoints start healthy so a cold gateway can route
            // immediately; the first probe corrects the optimism.
            status: HealthStatus::Healthy,
            priority: cfg.priority,
            last_checked: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            check_interval: Duration::from_millis(cfg.check_interval_ms),
        }
    }
}

/// The seam the routing pipeline consumes. Accessors return snapshots.
pub trait EndpointRepository: Send + Sync {
    /// Every known endpoint, regardless of health.
    fn all(&self) -> Vec<Endpoint>;

    /// Endpoints currently considered routable.
    fn healthy(&self) -> Vec<Endpoint> {
        self.all()
            .into_iter()
            .filter(|e| e.status == HealthStatus::Healthy)
            .collect()
    }
}

/// Config-seeded repository with health state maintained by the monitor.
///
/// The lock is held only long enough to clone or update the vector, so it
/// never blocks request handling meaningfully.
pub struct ConfigEndpointRepository {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl ConfigEndpointRepository {
    pub fn new(configs: &[EndpointConfig]) -> Self {
        Self {
            endpoints: RwLock::new(configs.iter().map(Endpoint::from_config).collect()),
        }
    }

    /// Record the outcome of one health probe and apply status transitions.
    pub fn record_probe(&self, name: &str, latency_ms: Option<u64>, ok: bool) {
        let mut endpoints = self.endpoints.write().expect("endpoint lock poisoned");
        let Some(ep) = endpoints.iter_mut().find(|e| e.name == name) else {
            return;
        };

        ep.last_checked = Some(Utc::now());
        ep.last_latency_ms = latency_ms;

        if ok {
            if ep.status != HealthStatus::Healthy {
                info!(endpoint = %ep.name, "endpoint recovered");
            }
            ep.consecutive_failures = 0;
            ep.status = HealthStatus::Healthy;
            return;
        }

        ep.consecutive_failures = ep.consecutive_failures.saturating_add(1);
        let next = if ep.consecutive_failures >= OFFLINE_AFTER {
            HealthStatus::Offline
        } else if ep.consecutive_failures >= UNHEALTHY_AFTER {
            HealthStatus::Unhealthy
        } else {
            ep.status
        };
        if next != ep.status {
            warn!(
                endpoint = %ep.name,
                failures = ep.consecutive_failures,
                from = ?ep.status,
                to = ?next,
                "endpoint health degraded"
            );
        }
        ep.status = next;
    }
}

impl EndpointRepository for ConfigEndpointRepository {
    fn all(&self) -> Vec<Endpoint> {
        self.endpoints.read().expect("endpoint lock poisoned").clone()
    }
}

/// Background task: probes each endpoint's model discovery path on its
/// configured interval and feeds outcomes into the repository.
///
/// One task serves the whole fleet; per-endpoint intervals are honoured by
/// tracking elapsed time against a coarse shared tick.
pub async fn health_monitor(
    repo: std::sync::Arc<ConfigEndpointRepository>,
    profiles: ProfileLookup,
    client: reqwest::Client,
) {
    let tick = Duration::from_secs(1);
    let mut interval = tokio::time::interval(tick);
    let mut elapsed: std::collections::HashMap<String, Duration> = Default::default();

    loop {
        interval.tick().await;

        for ep in repo.all() {
            let due = {
                let e = elapsed.entry(ep.name.clone()).or_insert(ep.check_interval);
                *e += tick;
                if *e >= ep.check_interval {
                    *e = Duration::ZERO;
                    true
                } else {
                    false
                }
            };
            if !due {
                continue;
            }

            let probe_path = profiles
                .by_type(&ep.backend_type)
                .map(|p| p.api.model_discovery_path.as_str())
                .unwrap_or("/");
            let url = format!("{}{}", ep.url, probe_path);

            let t0 = std::time::Instant::now();
            let result = client.get(&url).send().await;
            let latency_ms = t0.elapsed().as_millis() as u64;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(endpoint = %ep.name, latency_ms, "health probe ok");
                    repo.record_probe(&ep.name, Some(latency_ms), true);
                }
                Ok(resp) => {
                    debug!(endpoint = %ep.name, status = %resp.status(), "health probe failed");
                    repo.record_probe(&ep.name, Some(latency_ms), false);
                }
                Err(e) => {
                    debug!(endpoint = %ep.name, error = %e, "health probe unreachable");
                    repo.record_probe(&ep.name, None, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with_one() -> ConfigEndpointRepository {
        ConfigEndpointRepository::new(&[EndpointConfig {
            name: "ep1".into(),
            url: "http://localhost:11434/".into(),
            backend_type: "ollama".into(),
            priority: 100,
            check_interval_ms: 5_000,
        }])
    }

    #[test]
    fn endpoints_start_healthy_with_trailing_slash_stripped() {
        let repo = repo_with_one();
        let all = repo.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, HealthStatus::Healthy);
        assert_eq!(all[0].url, "http://localhost:11434");
    }

    #[test]
    fn three_failures_mark_unhealthy() {
        let repo = repo_with_one();
        for _ in 0..2 {
            repo.record_probe("ep1", None, false);
        }
        assert_eq!(repo.all()[0].status, HealthStatus::Healthy);

        repo.record_probe("ep1", None, false);
        assert_eq!(repo.all()[0].status, HealthStatus::Unhealthy);
        assert!(repo.healthy().is_empty());
    }

    #[test]
    fn ten_failures_mark_offline() {
        let repo = repo_with_one();
        for _ in 0..10 {
            repo.record_probe("ep1", None, false);
        }
        assert_eq!(repo.all()[0].status, HealthStatus::Offline);
    }

    #[test]
    fn success_resets_failure_count_and_recovers() {
        let repo = repo_with_one();
        for _ in 0..5 {
            repo.record_probe("ep1", None, false);
        }
        assert_eq!(repo.all()[0].status, HealthStatus::Unhealthy);

        repo.record_probe("ep1", Some(12), true);
        let ep = &repo.all()[0];
        assert_eq!(ep.status, HealthStatus::Healthy);
        assert_eq!(ep.consecutive_failures, 0);
        assert_eq!(ep.last_latency_ms, Some(12));
        assert!(ep.last_checked.is_some());
    }

    #[test]
    fn probe_for_unknown_endpoint_is_ignored() {
        let repo = repo_with_one();
        repo.record_probe("no-such-endpoint", None, false);
        assert_eq!(repo.all()[0].consecutive_failures, 0);
    }
}
