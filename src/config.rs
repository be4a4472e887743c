//! Configuration types for olla.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [server]
//! port = 40114
//!
//! [profiles.ollama]
//! prefixes = ["ollama"]
//! [profiles.ollama.api]
//! model_discovery_path = "/api/tags"
//! openai_compatible = true
//!
//! [profiles.vllm]
//! prefixes = ["vllm"]
//! [profiles.vllm.api]
//! model_discovery_path = "/v1/models"
//! openai_compatible = true
//! [profiles.vllm.dialects.anthropic]
//! enabled = true
//! messages_path = "/v1/messages"
//!
//! [[endpoints]]
//! name = "local-ollama"
//! url  = "http://localhost:11434"
//! type = "ollama"
//!
//! [translators.anthropic]
//! enabled = true
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Dialect names a profile's support table may declare.
///
/// Kept as a fixed list so a typo in config (`dialects.anthorpic`) fails
/// validation at startup instead of silently disabling passthrough.
const KNOWN_DIALECTS: &[&str] = &["openai", "anthropic", "ollama"];

/// Normalise a provider prefix for lookup: lowercase, `_` → `-`.
///
/// `/olla/lmstudio/...`, `/olla/LM_Studio/...` and `/olla/lm-studio/...`
/// must all resolve to the same profile.
pub fn normalize_prefix(raw: &str) -> String {
    raw.to_ascii_lowercase().replace('_', "-")
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend profiles — one per backend family (ollama, lm-studio, vllm, …).
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,

    /// Inference endpoints to front. Health state is tracked at runtime;
    /// this list only seeds identity, type and priority.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Dialect translators, keyed by translator name (e.g. `anthropic`).
    #[serde(default)]
    pub translators: HashMap<String, TranslatorConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Every endpoint must reference a known profile by type
        for ep in &self.endpoints {
            anyhow::ensure!(
                self.profiles.contains_key(&ep.backend_type),
                "endpoint `{}` references unknown profile type `{}`",
                ep.name,
                ep.backend_type
            );
        }

        // Endpoint names must be unique — they appear in routing headers
        let mut names = std::collections::HashSet::new();
        for ep in &self.endpoints {
            anyhow::ensure!(
                names.insert(ep.name.as_str()),
                "duplicate endpoint name `{}`",
                ep.name
            );
        }

        // Prefixes must be unique across profiles after normalisation,
        // otherwise /olla/{provider} routing would be ambiguous
        let mut seen: HashMap<String, &str> = HashMap::new();
        for (profile_name, profile) in &self.profiles {
            anyhow::ensure!(
                !profile.prefixes.is_empty(),
                "profile `{profile_name}` declares no prefixes"
            );
            for prefix in &profile.prefixes {
                let norm = normalize_prefix(prefix);
                if let Some(other) = seen.insert(norm.clone(), profile_name) {
                    anyhow::bail!(
                        "prefix `{norm}` is claimed by both profile `{other}` and `{profile_name}`"
                    );
                }
            }

            for (dialect, support) in &profile.dialects {
                anyhow::ensure!(
                    KNOWN_DIALECTS.contains(&dialect.as_str()),
                    "profile `{profile_name}` declares unknown dialect `{dialect}`"
                );
                if support.enabled {
                    anyhow::ensure!(
                        support.messages_path.starts_with('/'),
                        "profile `{profile_name}` dialect `{dialect}`: messages_path must start with `/`"
                    );
                }
            }
        }

        // A translator prefix must not shadow a profile prefix
        for name in self.translators.keys() {
            anyhow::ensure!(
                !seen.contains_key(normalize_prefix(name).as_str()),
                "translator `{name}` collides with a profile prefix of the same name"
            );
        }

        Ok(())
    }

    /// Look up a translator's config entry, treating absence as disabled.
    pub fn translator(&self, name: &str) -> Option<&TranslatorConfig> {
        self.translators.get(name).filter(|t| t.enabled)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0).
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Listen port (default: 40114).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Read timeout for request bodies in milliseconds (default: 30 000).
    #[serde(default = "defaults::read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds (default: 0 = disabled).
    ///
    /// Long-running streaming responses require this to stay 0; a non-zero
    /// value is accepted but logged as a warning at startup because it will
    /// sever SSE streams mid-response.
    #[serde(default)]
    pub write_timeout_ms: u64,

    /// Server-wide ceiling on request body size in bytes (default: 10 MiB).
    /// Translators may declare a lower per-dialect limit, never a higher one.
    #[serde(default = "defaults::max_body_size")]
    pub max_body_size: usize,

    /// Emit a tracing line per request/response pair (default: true).
    #[serde(default = "defaults::request_logging")]
    pub request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty server config must deserialize via defaults")
    }
}

/// A backend profile — declarative description of one backend family.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileConfig {
    /// URL prefixes this profile answers on under `/olla/…`.
    /// The first prefix is treated as canonical in listings.
    pub prefixes: Vec<String>,

    pub api: ProfileApiConfig,

    /// Dialect support table, keyed by dialect name.
    ///
    /// An entry with `enabled = true` means endpoints of this backend type
    /// natively understand the dialect and are passthrough candidates.
    #[serde(default)]
    pub dialects: HashMap<String, DialectSupport>,
}

impl ProfileConfig {
    /// Whether this backend family natively speaks the named dialect.
    pub fn supports_dialect(&self, dialect: &str) -> bool {
        self.dialects.get(dialect).map(|d| d.enabled).unwrap_or(false)
    }

    /// The native request path for the named dialect, when supported.
    pub fn dialect_path(&self, dialect: &str) -> Option<&str> {
        self.dialects
            .get(dialect)
            .filter(|d| d.enabled)
            .map(|d| d.messages_path.as_str())
    }
}

/// API-shape facts about a backend family.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileApiConfig {
    /// Path that lists the backend's models in its native schema.
    pub model_discovery_path: String,

    /// Whether the backend serves OpenAI-style `/v1/chat/completions`.
    #[serde(default)]
    pub openai_compatible: bool,
}

/// One dialect entry in a profile's support table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DialectSupport {
    #[serde(default)]
    pub enabled: bool,

    /// The backend-native path requests in this dialect are sent to.
    #[serde(default)]
    pub messages_path: String,
}

/// One configured inference endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Unique endpoint name — surfaced in `X-Olla-Endpoint` and listings.
    pub name: String,

    /// Base URL, scheme included (e.g. `http://localhost:11434`).
    pub url: String,

    /// Backend type tag — must match a configured profile name.
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Selection priority; higher is preferred (default: 100).
    #[serde(default = "defaults::priority")]
    pub priority: u32,

    /// Health probe interval in milliseconds (default: 5 000).
    #[serde(default = "defaults::check_interval_ms")]
    pub check_interval_ms: u64,
}

/// Per-translator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranslatorConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Maximum accepted request body in bytes for this translator.
    ///
    /// Unset means the translator's own declared limit applies
    /// (10 MiB when it declares none).
    #[serde(default)]
    pub max_message_size: Option<usize>,
}

mod defaults {
    pub fn host() -> String { "0.0.0.0".into() }
    pub fn port() -> u16 { 40114 }
    pub fn read_timeout_ms() -> u64 { 30_000 }
    pub fn max_body_size() -> usize { 10 * 1024 * 1024 }
    pub fn request_logging() -> bool { true }
    pub fn priority() -> u32 { 100 }
    pub fn check_interval_ms() -> u64 { 5_000 }
    pub fn enabled() -> bool { true }
}
