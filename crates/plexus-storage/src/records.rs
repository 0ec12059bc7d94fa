use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

/// One row per dispatched request, written exactly once when the request
/// completes (success, error, or client disconnect alike).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub source_ip: Option<String>,
    pub api_key_id: Option<String>,
    pub incoming_dialect: String,
    pub outgoing_dialect: Option<String>,
    pub incoming_model_alias: String,
    pub selected_provider: Option<String>,
    pub selected_model_slug: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    /// Set when the pricing source had no entry for the slug.
    pub pricing_unknown: bool,
    pub duration_ms: i64,
    pub ttft_ms: Option<i64>,
    pub is_streamed: bool,
    /// HTTP status surfaced to the client, or `client_disconnect`.
    pub response_status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// A parked provider or account. Key is `provider_id` or
/// `provider_id#account_email`. Absent from the live map once expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub key: String,
    pub expiry_epoch_ms: i64,
    pub reason: String,
    pub consecutive_failures: u32,
}

/// One OAuth credential per `(provider_kind, user_identifier)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub provider_kind: String,
    pub user_identifier: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
    #[serde(default)]
    pub metadata: JsonValue,
}
