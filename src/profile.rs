//! Backend profile lookup.
//!
//! Profiles are declarative descriptions of backend families loaded from
//! config. The pipeline never reads config directly — it goes through
//! [`ProfileLookup`], which indexes profiles by normalised prefix and by
//! backend type, and answers the two questions routing cares about:
//! which profile owns a URL prefix, and which backend types natively speak
//! a given dialect.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{normalize_prefix, Config, ProfileConfig};

/// A wire-level API schema family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// OpenAI chat-completions (`/v1/chat/completions`).
    OpenAI,
    /// Anthropic Messages (`/v1/messages`).
    Anthropic,
    /// Ollama native (`/api/chat`, `/api/generate`).
    Ollama,
}

impl Dialect {
    /// The dialect's key in a profile's support table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable profile index shared across the pipeline.
///
/// Built once at startup; cloning is cheap (`Arc` internals).
#[derive(Clone)]
pub struct ProfileLookup {
    inner: Arc<Inner>,
}

struct Inner {
    /// Profile name → profile.
    by_type: HashMap<String, ProfileConfig>,
    /// Normalised prefix → profile name.
    by_prefix: HashMap<String, String>,
}

impl ProfileLookup {
    pub fn from_config(config: &Config) -> Self {
        let mut by_prefix = HashMap::new();
        for (name, profile) in &config.profiles {
            for prefix in &profile.prefixes {
                by_prefix.insert(normalize_prefix(prefix), name.clone());
            }
        }
        Self {
            inner: Arc::new(Inner { by_type: config.profiles.clone(), by_prefix }),
        }
    }

    /// Resolve a backend type tag to its profile.
    ///
    /// Unknown types get `None`, which downstream treats as "no dialect
    /// support" — an endpoint with an unrecognised type can still serve
    /// plain forwards but never participates in translation or passthrough.
    pub fn by_type(&self, backend_type: &str) -> Option<&ProfileConfig> {
        self.inner.by_type.get(backend_type)
    }

    /// Resolve a raw `/olla/{provider}` segment to the canonical profile name.
    pub fn resolve_prefix(&self, raw: &str) -> Option<&str> {
        self.inner
            .by_prefix
            .get(normalize_prefix(raw).as_str())
            .map(|s| s.as_str())
    }

    /// All backend types whose profiles natively speak `dialect`.
    ///
    /// For the OpenAI dialect, `openai_compatible` in the API section counts
    /// as native support even without an explicit dialect table entry.
    pub fn types_supporting(&self, dialect: Dialect) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .by_type
            .iter()
            .filter(|(_, p)| {
                p.supports_dialect(dialect.as_str())
                    || (dialect == Dialect::OpenAI && p.api.openai_compatible)
            })
            .map(|(name, _)| name.clone())
            .collect();
        types.sort();
        types
    }

    /// All configured profile names.
    pub fn type_names(&self) -> Vec<&str> {
        self.inner.by_type.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> ProfileLookup {
        let config: Config = toml::from_str(
            r#"
            [profiles.ollama]
            prefixes = ["ollama"]
            [profiles.ollama.api]
            model_discovery_path = "/api/tags"
            openai_compatible = true

            [profiles.lm-studio]
            prefixes = ["lmstudio", "lm-studio", "lm_studio"]
            [profiles.lm-studio.api]
            model_discovery_path = "/api/v0/models"
            openai_compatible = true

            [profiles.vllm]
            prefixes = ["vllm"]
            [profiles.vllm.api]
            model_discovery_path = "/v1/models"
            openai_compatible = true
            [profiles.vllm.dialects.anthropic]
            enabled = true
            messages_path = "/v1/messages"
            "#,
        )
        .unwrap();
        ProfileLookup::from_config(&config)
    }

    #[test]
    fn resolves_all_lmstudio_spellings_to_one_profile() {
        let lookup = lookup();
        for spelling in ["lmstudio", "lm-studio", "lm_studio", "LM_Studio", "LMSTUDIO"] {
            assert_eq!(
                lookup.resolve_prefix(spelling),
                Some("lm-studio"),
                "spelling `{spelling}` must resolve"
            );
        }
    }

    #[test]
    fn unknown_prefix_resolves_to_none() {
        assert_eq!(lookup().resolve_prefix("totally-unknown"), None);
    }

    #[test]
    fn unknown_backend_type_has_no_profile() {
        assert!(lookup().by_type("mystery-runtime").is_none());
    }

    #[test]
    fn anthropic_dialect_supported_only_by_vllm() {
        assert_eq!(lookup().types_supporting(Dialect::Anthropic), vec!["vllm"]);
    }

    #[test]
    fn openai_compatible_counts_as_openai_dialect_support() {
        let types = lookup().types_supporting(Dialect::OpenAI);
        assert_eq!(types, vec!["lm-studio", "ollama", "vllm"]);
    }

    #[test]
    fn no_profile_supports_ollama_dialect_without_table_entry() {
        assert!(lookup().types_supporting(Dialect::Ollama).is_empty());
    }
}
