//! Unified model registry.
//!
//! Each backend family lists its models in a different native schema; the
//! registry folds all of them into one catalog of [`UnifiedModel`]s keyed
//! by canonical id, and maintains the model → endpoint index the selector
//! uses for model-aware routing. The pipeline consumes the [`ModelRegistry`]
//! trait; the in-memory implementation is refreshed by a background task
//! polling each endpoint's discovery path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointRepository};
use crate::profile::ProfileLookup;

/// Whether a model is resident in backend memory or merely on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Loaded,
    Available,
}

/// One backend serving a model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSource {
    pub endpoint_name: String,
    pub endpoint_url: String,
    pub backend_type: String,
    pub state: ModelState,
}

/// One logical model reconciled across backends.
#[derive(Debug, Clone, Serialize)]
pub struct UnifiedModel {
    /// Canonical id — the longest observed native id, lowercased.
    pub id: String,
    pub family: Option<String>,
    pub variant: Option<String>,
    pub parameter_count: Option<String>,
    pub quantization: Option<String>,
    pub format: Option<String>,
    pub model_type: Option<String>,
    pub aliases: Vec<String>,
    pub sources: Vec<ModelSource>,
    pub disk_size: Option<u64>,
    pub last_seen: DateTime<Utc>,
}

impl UnifiedModel {
    /// Whether any source endpoint is in the given set of healthy names.
    pub fn available_on(&self, healthy_names: &[&str]) -> bool {
        self.sources.iter().any(|s| healthy_names.contains(&s.endpoint_name.as_str()))
    }
}

/// The seam the selector and the listing handlers consume.
pub trait ModelRegistry: Send + Sync {
    /// URLs of endpoints currently known to host `model` (id or alias).
    fn endpoints_for_model(&self, model: &str) -> Vec<String>;

    /// The full unified catalog.
    fn unified_models(&self) -> Vec<UnifiedModel>;

    /// A single model by id or alias.
    fn model(&self, id_or_alias: &str) -> Option<UnifiedModel> {
        let needle = id_or_alias.to_ascii_lowercase();
        self.unified_models()
            .into_iter()
            .find(|m| m.id == needle || m.aliases.iter().any(|a| *a == needle))
    }
}

/// A model as one endpoint reported it, before unification.
#[derive(Debug, Clone)]
struct DiscoveredModel {
    id: String,
    family: Option<String>,
    parameter_count: Option<String>,
    quantization: Option<String>,
    format: Option<String>,
    model_type: Option<String>,
    state: ModelState,
    disk_size: Option<u64>,
}

/// In-memory registry: per-endpoint model tables, folded on read.
///
/// Writes happen only from the refresher task; reads take per-shard locks
/// briefly, so request handling is never blocked on a refresh.
#[derive(Default)]
pub struct InMemoryModelRegistry {
    tables: DashMap<String, (Endpoint, Vec<DiscoveredModel>, DateTime<Utc>)>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one endpoint's table with a freshly parsed listing.
    fn update(&self, endpoint: &Endpoint, models: Vec<DiscoveredModel>) {
        self.tables
            .insert(endpoint.name.clone(), (endpoint.clone(), models, Utc::now()));
    }

    /// Drop tables for endpoints that no longer exist.
    fn retain_known(&self, names: &[&str]) {
        self.tables.retain(|name, _| names.contains(&name.as_str()));
    }
}

impl ModelRegistry for InMemoryModelRegistry {
    fn endpoints_for_model(&self, model: &str) -> Vec<String> {
        let needle = model.to_ascii_lowercase();
        let bare = needle.split(':').next().unwrap_or(&needle);

        let mut urls = Vec::new();
        for entry in self.tables.iter() {
            let (endpoint, models, _) = entry.value();
            let hosts = models.iter().any(|m| {
                let id = m.id.to_ascii_lowercase();
                id == needle || id.split(':').next() == Some(bare)
            });
            if hosts {
                urls.push(endpoint.url.clone());
            }
        }
        urls.sort();
        urls
    }

    fn unified_models(&self) -> Vec<UnifiedModel> {
        let mut by_id: std::collections::HashMap<String, UnifiedModel> = Default::default();

        for entry in self.tables.iter() {
            let (endpoint, models, seen_at) = entry.value();
            for m in models {
                let canonical = m.id.to_ascii_lowercase();
                let bare = canonical.split(':').next().unwrap_or(&canonical).to_string();

                let unified = by_id.entry(canonical.clone()).or_insert_with(|| UnifiedModel {
                    id: canonical.clone(),
                    family: m.family.clone(),
                    variant: canonical.split(':').nth(1).map(str::to_string),
                    parameter_count: m.parameter_count.clone(),
                    quantization: m.quantization.clone(),
                    format: m.format.clone(),
                    model_type: m.model_type.clone(),
                    aliases: if bare != canonical { vec![bare.clone()] } else { Vec::new() },
                    sources: Vec::new(),
                    disk_size: m.disk_size,
                    last_seen: *seen_at,
                });

                // Later endpoints may know details earlier ones omitted.
                unified.family = unified.family.take().or_else(|| m.family.clone());
                unified.parameter_count =
                    unified.parameter_count.take().or_else(|| m.parameter_count.clone());
                unified.quantization =
                    unified.quantization.take().or_else(|| m.quantization.clone());
                unified.format = unified.format.take().or_else(|| m.format.clone());
                unified.model_type = unified.model_type.take().or_else(|| m.model_type.clone());
                unified.disk_size = unified.disk_size.take().or(m.disk_size);
                unified.last_seen = unified.last_seen.max(*seen_at);

                unified.sources.push(ModelSource {
                    endpoint_name: endpoint.name.clone(),
                    endpoint_url: endpoint.url.clone(),
                    backend_type: endpoint.backend_type.clone(),
                    state: m.state,
                });
            }
        }

        let mut all: Vec<UnifiedModel> = by_id.into_values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

// ─── Listing parsers ─────────────────────────────────────────────────────────

/// Parse a backend's native model listing into discovered models.
///
/// The schema is selected by the profile's discovery path, not the HTTP
/// response, so a misconfigured backend fails loudly in logs instead of
/// being half-parsed.
fn parse_listing(discovery_path: &str, json: &Value) -> Vec<DiscoveredModel> {
    if discovery_path.ends_with("/api/tags") {
        parse_ollama_tags(json)
    } else if discovery_path.ends_with("/api/v0/models") || discovery_path.ends_with("/api/v1/models")
    {
        parse_lmstudio_models(json)
    } else {
        parse_openai_models(json)
    }
}

/// Ollama `GET /api/tags`.
fn parse_ollama_tags(json: &Value) -> Vec<DiscoveredModel> {
    json.get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    let id = m.get("name").or_else(|| m.get("model"))?.as_str()?.to_string();
                    let details = m.get("details");
                    let detail = |key: &str| {
                        details
                            .and_then(|d| d.get(key))
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                    };
                    Some(DiscoveredModel {
                        id,
                        family: detail("family"),
                        parameter_count: detail("parameter_size"),
                        quantization: detail("quantization_level"),
                        format: detail("format"),
                        model_type: Some("llm".into()),
                        state: ModelState::Available,
                        disk_size: m.get("size").and_then(Value::as_u64),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// LM Studio `GET /api/v0/models` (also served at `/api/v1/models`).
fn parse_lmstudio_models(json: &Value) -> Vec<DiscoveredModel> {
    json.get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    let id = m.get("id")?.as_str()?.to_string();
                    let field = |key: &str| {
                        m.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
                    };
                    let state = match m.get("state").and_then(Value::as_str) {
                        Some("loaded") => ModelState::Loaded,
                        _ => ModelState::Available,
                    };
                    Some(DiscoveredModel {
                        id,
                        family: field("arch"),
                        parameter_count: None,
                        quantization: field("quantization"),
                        format: field("compatibility_type"),
                        model_type: field("type"),
                        state,
                        disk_size: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Plain OpenAI-compatible `GET /v1/models` — ids only.
fn parse_openai_models(json: &Value) -> Vec<DiscoveredModel> {
    json.get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    let id = m.get("id")?.as_str()?.to_string();
                    Some(DiscoveredModel {
                        id,
                        family: None,
                        parameter_count: None,
                        quantization: None,
                        format: None,
                        model_type: None,
                        state: ModelState::Available,
                        disk_size: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Background task: polls every healthy endpoint's discovery path and
/// refreshes the registry tables.
pub async fn model_refresher(
    registry: Arc<InMemoryModelRegistry>,
    repo: Arc<dyn EndpointRepository>,
    profiles: ProfileLookup,
    client: reqwest::Client,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let endpoints = repo.all();
        let names: Vec<&str> = endpoints.iter().map(|e| e.name.as_str()).collect();
        registry.retain_known(&names);

        for ep in repo.healthy() {
            let Some(profile) = profiles.by_type(&ep.backend_type) else {
                continue;
            };
            let path = profile.api.model_discovery_path.clone();
            let url = format!("{}{}", ep.url, path);

            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(json) => {
                        let models = parse_listing(&path, &json);
                        debug!(endpoint = %ep.name, count = models.len(), "model listing refreshed");
                        registry.update(&ep, models);
                    }
                    Err(e) => debug!(endpoint = %ep.name, error = %e, "model listing unparsable"),
                },
                Ok(resp) => {
                    debug!(endpoint = %ep.name, status = %resp.status(), "model listing fetch failed")
                }
                Err(e) => debug!(endpoint = %ep.name, error = %e, "model listing unreachable"),
            }
        }
    }
}
