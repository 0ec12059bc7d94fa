//! PKCE-backed OAuth code flow for the provider families that use
//! short-lived bearer tokens.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Pending authorize sessions expire after this long; expired sessions
/// are garbage-collected on access.
const SESSION_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthKind {
    ClaudeCode,
    GeminiCli,
}

impl OAuthKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "claude-code" => Some(OAuthKind::ClaudeCode),
            "gemini-cli" => Some(OAuthKind::GeminiCli),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthKind::ClaudeCode => "claude-code",
            OAuthKind::GeminiCli => "gemini-cli",
        }
    }

    /// How close to expiry a token may get before dispatch refreshes it.
    pub fn refresh_threshold(&self) -> Duration {
        match self {
            OAuthKind::ClaudeCode => Duration::from_secs(10 * 60),
            OAuthKind::GeminiCli => Duration::from_secs(4 * 3600),
        }
    }

    fn authorize_base(&self) -> &'static str {
        match self {
            OAuthKind::ClaudeCode => "https://claude.ai/oauth/authorize",
            OAuthKind::GeminiCli => "https://accounts.google.com/o/oauth2/v2/auth",
        }
    }

    fn token_url(&self) -> &'static str {
        match self {
            OAuthKind::ClaudeCode => "https://api.anthropic.com/v1/oauth/token",
            OAuthKind::GeminiCli => "https://oauth2.googleapis.com/token",
        }
    }

    fn client_id(&self) -> &'static str {
        match self {
            OAuthKind::ClaudeCode => "9d1c250a-e61b-44d9-88ed-5944d1962f5e",
            OAuthKind::GeminiCli => {
                "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com"
            }
        }
    }

    fn scope(&self) -> &'static str {
        match self {
            OAuthKind::ClaudeCode => "user:profile user:inference",
            OAuthKind::GeminiCli => {
                "https://www.googleapis.com/auth/cloud-platform \
                 https://www.googleapis.com/auth/userinfo.email \
                 https://www.googleapis.com/auth/userinfo.profile"
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("unknown oauth session state")]
    UnknownState,
    #[error("token endpoint rejected the request: {status} {body}")]
    TokenRejected { status: u16, body: String },
    #[error("oauth transport failed: {0}")]
    Transport(String),
    #[error("token response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until expiry.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug)]
struct PendingSession {
    code_verifier: String,
    redirect_uri: String,
    created_at: Instant,
}

#[derive(Debug)]
struct PkceCodes {
    code_verifier: String,
    code_challenge: String,
}

fn generate_pkce() -> PkceCodes {
    let mut bytes = [0u8; 48];
    rand::rng().fill_bytes(&mut bytes);
    let code_verifier = URL_SAFE_NO_PAD.encode(bytes);
    let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
    PkceCodes {
        code_verifier,
        code_challenge,
    }
}

/// Authorize-session bookkeeping plus the token-endpoint calls. One
/// broker per process, owned by the credential pool; no globals.
pub struct OAuthBroker {
    http: wreq::Client,
    sessions: Mutex<HashMap<String, PendingSession>>,
}

impl OAuthBroker {
    pub fn new(timeout: Duration) -> Result<Self, wreq::Error> {
        Ok(Self {
            http: wreq::Client::builder().timeout(timeout).build()?,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Build the authorize URL and remember the verifier under a fresh
    /// `state`.
    pub fn authorize_url(&self, kind: OAuthKind, redirect_uri: &str) -> (String, String) {
        let state = uuid::Uuid::new_v4().to_string();
        let pkce = generate_pkce();
        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            kind.authorize_base(),
            urlencoding::encode(kind.client_id()),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(kind.scope()),
            urlencoding::encode(&pkce.code_challenge),
            urlencoding::encode(&state),
        );
        if let Ok(mut sessions) = self.sessions.lock() {
            prune_sessions(&mut sessions);
            sessions.insert(
                state.clone(),
                PendingSession {
                    code_verifier: pkce.code_verifier,
                    redirect_uri: redirect_uri.to_string(),
                    created_at: Instant::now(),
                },
            );
        }
        (url, state)
    }

    /// Trade the callback code for tokens using the verifier stored
    /// under `state`.
    pub async fn exchange(
        &self,
        kind: OAuthKind,
        state: &str,
        code: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| OAuthError::Transport("session lock poisoned".into()))?;
            prune_sessions(&mut sessions);
            sessions.remove(state).ok_or(OAuthError::UnknownState)?
        };
        let body = format!(
            "grant_type=authorization_code&client_id={}&code={}&redirect_uri={}&code_verifier={}",
            urlencoding::encode(kind.client_id()),
            urlencoding::encode(code),
            urlencoding::encode(&session.redirect_uri),
            urlencoding::encode(&session.code_verifier),
        );
        self.post_token(kind, body).await
    }

    pub async fn refresh(
        &self,
        kind: OAuthKind,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let body = format!(
            "grant_type=refresh_token&client_id={}&refresh_token={}",
            urlencoding::encode(kind.client_id()),
            urlencoding::encode(refresh_token),
        );
        self.post_token(kind, body).await
    }

    async fn post_token(&self, kind: OAuthKind, body: String) -> Result<TokenResponse, OAuthError> {
        let response = self
            .http
            .post(kind.token_url())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| OAuthError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| OAuthError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(OAuthError::TokenRejected {
                status,
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|err| OAuthError::Malformed(err.to_string()))
    }
}

/// The one call the credential pool needs from the OAuth layer; split
/// out so pool tests can count token-endpoint hits.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_token(
        &self,
        kind: OAuthKind,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuthError>;
}

#[async_trait::async_trait]
impl TokenRefresher for OAuthBroker {
    async fn refresh_token(
        &self,
        kind: OAuthKind,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuthError> {
        self.refresh(kind, refresh_token).await
    }
}

fn prune_sessions(sessions: &mut HashMap<String, PendingSession>) {
    let now = Instant::now();
    sessions.retain(|_, session| now.duration_since(session.created_at) < SESSION_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_pkce_and_state() {
        let broker = OAuthBroker::new(Duration::from_secs(20)).unwrap();
        let (url, state) = broker.authorize_url(OAuthKind::ClaudeCode, "http://127.0.0.1/cb");
        assert!(url.starts_with("https://claude.ai/oauth/authorize?"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={state}")));
    }

    #[tokio::test]
    async fn exchange_without_session_is_rejected() {
        let broker = OAuthBroker::new(Duration::from_secs(20)).unwrap();
        let err = broker
            .exchange(OAuthKind::ClaudeCode, "missing", "code")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::UnknownState));
    }

    #[test]
    fn thresholds_differ_by_family() {
        assert_eq!(
            OAuthKind::ClaudeCode.refresh_threshold(),
            Duration::from_secs(600)
        );
        assert_eq!(
            OAuthKind::GeminiCli.refresh_threshold(),
            Duration::from_secs(14_400)
        );
    }
}
