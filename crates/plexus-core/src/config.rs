//! Frozen configuration snapshot. Loaded at startup (and on reload) and
//! shared read-only; in-flight requests keep the snapshot they started
//! with, swapped atomically underneath them.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use plexus_transform::Dialect;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
    #[serde(default)]
    pub models: Vec<ModelAlias>,
    #[serde(default)]
    pub client_keys: Vec<ClientKey>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl ConfigSnapshot {
    pub fn provider(&self, id: &str) -> Option<&ProviderRecord> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    /// Alias lookup by primary id or any secondary alias.
    pub fn alias(&self, name: &str) -> Option<&ModelAlias> {
        self.models
            .iter()
            .find(|alias| alias.id == name || alias.aliases.iter().any(|a| a == name))
    }

    pub fn client_key_id(&self, presented: &str) -> Option<&str> {
        self.client_keys
            .iter()
            .find(|key| key.key == presented)
            .map(|key| key.id.as_str())
    }
}

/// Snapshot holder: readers `load()`, the reloader `store()`s a new
/// snapshot. No in-place mutation.
#[derive(Debug)]
pub struct ConfigHandle {
    inner: ArcSwap<ConfigSnapshot>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    pub fn store(&self, snapshot: ConfigSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientKey {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub supported_dialects: Vec<Dialect>,
    pub api_base_url: ApiBaseUrl,
    pub auth: AuthConfig,
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
    /// Multiplicative cost discount in `[0, 1]`.
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Deep-merged into every outgoing request document.
    #[serde(default)]
    pub extra_body: Option<JsonValue>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderRecord {
    pub fn base_url(&self, dialect: Dialect) -> Option<&str> {
        match &self.api_base_url {
            ApiBaseUrl::One(url) => Some(url.as_str()),
            ApiBaseUrl::PerDialect(map) => map.get(&dialect).map(String::as_str),
        }
    }

    pub fn supports(&self, dialect: Dialect) -> bool {
        self.supported_dialects.contains(&dialect)
    }

    /// Dialects a model may be reached through: `access_via` when set,
    /// otherwise everything the provider speaks.
    pub fn dialects_for_model(&self, slug: &str) -> Vec<Dialect> {
        let access_via = self
            .models
            .get(slug)
            .map(|entry| entry.access_via.as_slice())
            .unwrap_or_default();
        if access_via.is_empty() {
            self.supported_dialects.clone()
        } else {
            self.supported_dialects
                .iter()
                .copied()
                .filter(|dialect| access_via.contains(dialect))
                .collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiBaseUrl {
    One(String),
    PerDialect(BTreeMap<Dialect, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    ApiKey {
        value: String,
    },
    Oauth {
        /// OAuth family, e.g. `claude-code` or `gemini-cli`.
        provider_kind: String,
        /// Account emails rotated by the credential pool.
        account_pool: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub pricing: Pricing,
    #[serde(default)]
    pub access_via: Vec<Dialect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pricing {
    /// Flat USD per million tokens.
    Simple {
        input_per_m: f64,
        output_per_m: f64,
        #[serde(default)]
        cached_per_m: Option<f64>,
    },
    /// Tiered by input-token count, half-open `[lower, upper)`;
    /// `upper_bound` absent or `0` reads as unbounded.
    Ranges { ranges: Vec<PriceRange> },
    /// Rates resolved at record time through the pricing oracle.
    Openrouter { slug: String },
}

impl Default for Pricing {
    fn default() -> Self {
        Pricing::Simple {
            input_per_m: 0.0,
            output_per_m: 0.0,
            cached_per_m: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    #[serde(default)]
    pub lower_bound: u64,
    #[serde(default)]
    pub upper_bound: Option<u64>,
    pub input_per_m: f64,
    pub output_per_m: f64,
    #[serde(default)]
    pub cached_per_m: Option<f64>,
}

impl PriceRange {
    pub fn contains(&self, input_tokens: u64) -> bool {
        if input_tokens < self.lower_bound {
            return false;
        }
        match self.upper_bound {
            None | Some(0) => true,
            Some(upper) => input_tokens < upper,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAlias {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub selector: SelectorKind,
    #[serde(default)]
    pub priority: PriorityMode,
    pub targets: Vec<AliasTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasTarget {
    pub provider_id: String,
    pub model_slug: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    Random,
    InOrder,
    Cost,
    Latency,
    Usage,
    Performance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    #[default]
    Selector,
    ApiMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds to establish the upstream connection.
    pub upstream_connect_secs: u64,
    /// Hard cap for a unary upstream exchange.
    pub upstream_total_secs: u64,
    /// Idle-read cap while streaming (no total cap applies).
    pub stream_idle_secs: u64,
    /// OAuth token-endpoint cap.
    pub oauth_refresh_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_connect_secs: 10,
            upstream_total_secs: 60,
            stream_idle_secs: 60,
            oauth_refresh_secs: 20,
        }
    }
}
