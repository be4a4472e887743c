//! Unified model catalog endpoints (`/olla/models`).
//!
//! The catalog is a read-only view over the model registry, filterable by
//! endpoint, family, type and availability, and renderable in several wire
//! formats so existing clients (Ollama CLIs, OpenAI SDKs, LM Studio UIs)
//! can browse the fleet without learning a new schema.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::registry::{ModelState, UnifiedModel};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ModelQuery {
    #[serde(default)]
    pub format: Option<String>,
    pub endpoint: Option<String>,
    pub family: Option<String>,
    #[serde(rename = "type")]
    pub model_type: Option<String>,
    pub available: Option<bool>,
    pub include_unavailable: Option<bool>,
    /// Legacy alias for `type`, kept for old clients.
    pub capability: Option<String>,
}

/// `GET /olla/models` — filtered, sorted unified catalog.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModelQuery>,
) -> Result<Response, GatewayError> {
    let healthy = state.endpoints.healthy();
    let healthy_names: Vec<&str> = healthy.iter().map(|e| e.name.as_str()).collect();

    let models = filter_models(state.registry.unified_models(), &query, &healthy_names)?;

    let format = query.format.as_deref().unwrap_or("unified");
    let body = match format {
        "unified" => render_unified(&models, &healthy_names),
        "openai" => render_openai(&models),
        "ollama" => render_ollama(&models),
        "lmstudio" => render_lmstudio(&models, &healthy_names),
        other => {
            return Err(GatewayError::BadInput(format!("unknown format `{other}`")));
        }
    };

    Ok(Json(body).into_response())
}

/// `GET /olla/models/{id}` — a single unified model by id or alias.
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let model = state
        .registry
        .model(&id)
        .ok_or_else(|| GatewayError::ModelNotAvailable(id.clone()))?;

    let healthy = state.endpoints.healthy();
    let healthy_names: Vec<&str> = healthy.iter().map(|e| e.name.as_str()).collect();
    Ok(Json(unified_json(&model, &healthy_names)).into_response())
}

pub(crate) fn filter_models(
    models: Vec<UnifiedModel>,
    query: &ModelQuery,
    healthy_names: &[&str],
) -> Result<Vec<UnifiedModel>, GatewayError> {
    // `capability` is the legacy spelling of `type`
    let wanted_type = query.model_type.as_deref().or(query.capability.as_deref());

    let include_unavailable = query.include_unavailable.unwrap_or(false);

    Ok(models
        .into_iter()
        .filter(|m| {
            if let Some(endpoint) = query.endpoint.as_deref() {
                if !m.sources.iter().any(|s| s.endpoint_name == endpoint) {
                    return false;
                }
            }
            if let Some(family) = query.family.as_deref() {
                if !m.family.as_deref().is_some_and(|f| f.eq_ignore_ascii_case(family)) {
                    return false;
                }
            }
            if let Some(t) = wanted_type {
                if !m.model_type.as_deref().is_some_and(|mt| mt.eq_ignore_ascii_case(t)) {
                    return false;
                }
            }

            let available = m.available_on(healthy_names);
            if let Some(wanted) = query.available {
                if available != wanted {
                    return false;
                }
            }
            if !include_unavailable && !available {
                return false;
            }
            true
        })
        .collect())
}

fn state_str(state: ModelState) -> &'static str {
    match state {
        ModelState::Loaded => "loaded",
        ModelState::Available => "available",
    }
}

/// The native unified shape. Source endpoints are identified by name, not
/// URL — internal addresses stay internal.
fn unified_json(m: &UnifiedModel, healthy_names: &[&str]) -> Value {
    json!({
        "id": m.id,
        "family": m.family,
        "variant": m.variant,
        "parameter_count": m.parameter_count,
        "quantization": m.quantization,
        "format": m.format,
        "type": m.model_type,
        "aliases": m.aliases,
        "endpoints": m.sources.iter().map(|s| json!({
            "name": s.endpoint_name,
            "backend_type": s.backend_type,
            "state": state_str(s.state),
            "healthy": healthy_names.contains(&s.endpoint_name.as_str()),
        })).collect::<Vec<_>>(),
        "disk_size": m.disk_size,
        "last_seen": m.last_seen,
        "available": m.available_on(healthy_names),
    })
}

fn render_unified(models: &[UnifiedModel], healthy_names: &[&str]) -> Value {
    json!({
        "object": "list",
        "data": models.iter().map(|m| unified_json(m, healthy_names)).collect::<Vec<_>>(),
    })
}

pub(crate) fn render_openai(models: &[UnifiedModel]) -> Value {
    json!({
        "object": "list",
        "data": models.iter().map(|m| json!({
            "id": m.id,
            "object": "model",
            "created": m.last_seen.timestamp(),
            "owned_by": "olla",
        })).collect::<Vec<_>>(),
    })
}

pub(crate) fn render_ollama(models: &[UnifiedModel]) -> Value {
    json!({
        "models": models.iter().map(|m| json!({
            "name": m.id,
            "model": m.id,
            "size": m.disk_size.unwrap_or(0),
            "modified_at": m.last_seen,
            "details": {
                "family": m.family,
                "parameter_size": m.parameter_count,
                "quantization_level": m.quantization,
                "format": m.format,
            },
        })).collect::<Vec<_>>(),
    })
}

pub(crate) fn render_lmstudio(models: &[UnifiedModel], healthy_names: &[&str]) -> Value {
    json!({
        "object": "list",
        "data": models.iter().map(|m| json!({
            "id": m.id,
            "object": "model",
            "type": m.model_type.as_deref().unwrap_or("llm"),
            "arch": m.family,
            "quantization": m.quantization,
            "state": if m.sources.iter().any(|s| s.state == ModelState::Loaded) {
                "loaded"
            } else {
                "not-loaded"
            },
            "served_by": m.sources.iter()
                .filter(|s| healthy_names.contains(&s.endpoint_name.as_str()))
                .map(|s| s.endpoint_name.clone())
                .collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelSource;
    use chrono::Utc;

    fn model(id: &str, family: Option<&str>, endpoint: &str, state: ModelState) -> UnifiedModel {
        UnifiedModel {
            id: id.into(),
            family: family.map(str::to_string),
            variant: None,
            parameter_count: Some("8.0B".into()),
            quantization: Some("Q4_K_M".into()),
            format: Some("gguf".into()),
            model_type: Some("llm".into()),
            aliases: vec![],
            sources: vec![ModelSource {
                endpoint_name: endpoint.into(),
                endpoint_url: format!("http://{endpoint}"),
                backend_type: "ollama".into(),
                state,
            }],
            disk_size: Some(1_000),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn default_filter_drops_unavailable_models() {
        let models = vec![
            model("on-healthy", None, "up", ModelState::Available),
            model("on-dead", None, "down", ModelState::Available),
        ];
        let kept = filter_models(models, &ModelQuery::default(), &["up"]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "on-healthy");
    }

    #[test]
    fn include_unavailable_keeps_everything() {
        let models = vec![model("on-dead", None, "down", ModelState::Available)];
        let query = ModelQuery { include_unavailable: Some(true), ..Default::default() };
        assert_eq!(filter_models(models, &query, &["up"]).unwrap().len(), 1);
    }

    #[test]
    fn available_false_selects_only_unavailable() {
        let models = vec![
            model("up-model", None, "up", ModelState::Available),
            model("down-model", None, "down", ModelState::Available),
        ];
        let query = ModelQuery {
            available: Some(false),
            include_unavailable: Some(true),
            ..Default::default()
        };
        let kept = filter_models(models, &query, &["up"]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "down-model");
    }

    #[test]
    fn family_filter_is_case_insensitive() {
        let models = vec![
            model("a", Some("Llama"), "up", ModelState::Available),
            model("b", Some("qwen2"), "up", ModelState::Available),
        ];
        let query = ModelQuery { family: Some("llama".into()), ..Default::default() };
        let kept = filter_models(models, &query, &["up"]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
    }

    #[test]
    fn capability_is_mapped_to_type() {
        let mut embed = model("embedder", None, "up", ModelState::Available);
        embed.model_type = Some("embeddings".into());
        let models = vec![embed, model("chat", None, "up", ModelState::Available)];

        let query = ModelQuery { capability: Some("embeddings".into()), ..Default::default() };
        let kept = filter_models(models, &query, &["up"]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "embedder");
    }

    #[test]
    fn endpoint_filter_matches_by_name() {
        let models = vec![
            model("a", None, "ep1", ModelState::Available),
            model("b", None, "ep2", ModelState::Available),
        ];
        let query = ModelQuery { endpoint: Some("ep2".into()), ..Default::default() };
        let kept = filter_models(models, &query, &["ep1", "ep2"]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "b");
    }

    #[test]
    fn unified_json_exposes_names_not_urls() {
        let m = model("a", Some("llama"), "ep1", ModelState::Loaded);
        let body = unified_json(&m, &["ep1"]);
        let rendered = body.to_string();
        assert!(rendered.contains("\"ep1\""));
        assert!(!rendered.contains("http://ep1"), "endpoint URLs must not leak");
        assert_eq!(body["endpoints"][0]["state"], "loaded");
        assert_eq!(body["available"], true);
    }

    #[test]
    fn lmstudio_render_reports_loaded_state_and_serving_endpoints() {
        let m = model("a", Some("llama"), "ep1", ModelState::Loaded);
        let body = render_lmstudio(&[m], &["ep1"]);
        assert_eq!(body["data"][0]["state"], "loaded");
        assert_eq!(body["data"][0]["served_by"][0], "ep1");
    }

    #[test]
    fn ollama_render_has_native_details_shape() {
        let m = model("llama3.1:8b", Some("llama"), "ep1", ModelState::Available);
        let body = render_ollama(&[m]);
        assert_eq!(body["models"][0]["name"], "llama3.1:8b");
        assert_eq!(body["models"][0]["details"]["parameter_size"], "8.0B");
    }
}
