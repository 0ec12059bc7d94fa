use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Unique id attached to every dispatched request; echoed back to the
/// client in the `X-Plexus-Request-Id` header and written into the usage
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every failure mode a dispatch can end in. The dispatcher maps each
/// variant to an HTTP status; nothing below the dispatcher builds HTTP
/// responses.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{dialect} parse error at {field}: {reason}")]
    Parse {
        dialect: &'static str,
        field: String,
        reason: String,
    },
    #[error("model not found: {model}")]
    ModelNotFound { model: String },
    #[error("no healthy target for {model} (parked: {parked:?})")]
    NoHealthyTarget { model: String, parked: Vec<String> },
    #[error("all accounts exhausted for provider kind {kind}")]
    AllAccountsExhausted { kind: String },
    #[error("upstream auth failure ({status}) from {provider}")]
    UpstreamAuth { provider: String, status: u16 },
    #[error("upstream rate limited by {provider}")]
    UpstreamRateLimited { provider: String },
    #[error("upstream {provider} timed out")]
    UpstreamTimeout { provider: String },
    #[error("upstream server error ({detail}) from {provider}")]
    UpstreamServerError { provider: String, detail: String },
    #[error("upstream rejected request with {status}")]
    UpstreamClientError {
        provider: String,
        status: u16,
        body: bytes::Bytes,
    },
    #[error("client disconnected")]
    ClientDisconnect,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status surfaced to the client, per the error-handling table.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Parse { .. } => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyTarget { .. } | GatewayError::AllAccountsExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamAuth { .. }
            | GatewayError::UpstreamRateLimited { .. }
            | GatewayError::UpstreamServerError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::UpstreamClientError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            // 499 is not a registered code; axum still serializes it.
            GatewayError::ClientDisconnect => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code written into usage records and error
    /// bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Parse { .. } => "parse_error",
            GatewayError::ModelNotFound { .. } => "model_not_found",
            GatewayError::NoHealthyTarget { .. } => "no_healthy_target",
            GatewayError::AllAccountsExhausted { .. } => "all_accounts_exhausted",
            GatewayError::UpstreamAuth { .. } => "upstream_auth",
            GatewayError::UpstreamRateLimited { .. } => "upstream_rate_limited",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::UpstreamServerError { .. } => "upstream_server_error",
            GatewayError::UpstreamClientError { .. } => "upstream_client_error",
            GatewayError::ClientDisconnect => "client_disconnect",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Body sent to the client. Upstream 4xx bodies pass through
    /// verbatim; internal errors never leak details.
    pub fn client_body(&self) -> bytes::Bytes {
        match self {
            GatewayError::UpstreamClientError { body, .. } => body.clone(),
            GatewayError::Internal(_) => {
                bytes::Bytes::from_static(b"{\"error\":{\"code\":\"internal\"}}")
            }
            other => bytes::Bytes::from(
                serde_json::json!({
                    "error": { "code": other.code(), "message": other.to_string() }
                })
                .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_error_table() {
        let err = GatewayError::NoHealthyTarget {
            model: "gpt-4".into(),
            parked: vec!["openai".into()],
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "no_healthy_target");

        let err = GatewayError::UpstreamRateLimited {
            provider: "openai".into(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err = GatewayError::ClientDisconnect;
        assert_eq!(err.status().as_u16(), 499);
    }

    #[test]
    fn internal_errors_do_not_leak() {
        let err = GatewayError::Internal("router invariant violated: xyz".into());
        let body = String::from_utf8_lossy(&err.client_body()).to_string();
        assert!(!body.contains("router invariant"));
    }
}
