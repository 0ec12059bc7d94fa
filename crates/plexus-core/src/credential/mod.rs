//! Per-account OAuth credential pool: round-robin rotation with expiry
//! and cooldown filtering, single-flight refresh.

pub mod oauth;
pub mod refresher;

pub use oauth::{OAuthBroker, OAuthError, OAuthKind, TokenRefresher, TokenResponse};
pub use refresher::{RefresherHandle, spawn_refresher};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use plexus_common::GatewayError;
use plexus_storage::{CredentialRecord, CredentialStore};

use crate::cooldown::{CooldownManager, account_key};

/// A credential is eligible for dispatch only while it outlives this
/// margin.
const ELIGIBILITY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct PooledCredential {
    kind: String,
    user: String,
    record: tokio::sync::RwLock<CredentialRecord>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl PooledCredential {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub async fn access_token(&self) -> String {
        self.record.read().await.access_token.clone()
    }

    pub async fn expires_at(&self) -> i64 {
        self.record.read().await.expires_at
    }
}

pub struct CredentialPool {
    store: Arc<dyn CredentialStore>,
    cooldowns: Arc<CooldownManager>,
    refresher: Arc<dyn TokenRefresher>,
    entries: tokio::sync::RwLock<HashMap<String, Vec<Arc<PooledCredential>>>>,
    cursors: Mutex<HashMap<String, usize>>,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cooldowns: Arc<CooldownManager>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            store,
            cooldowns,
            refresher,
            entries: tokio::sync::RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Load the accounts a provider's pool names. Accounts without a
    /// stored credential are skipped with a warning; they need a login.
    pub async fn load_accounts(&self, kind: &str, accounts: &[String]) {
        let mut loaded = Vec::new();
        for user in accounts {
            match self.store.get(kind, user).await {
                Ok(Some(record)) => {
                    loaded.push(Arc::new(PooledCredential {
                        kind: kind.to_string(),
                        user: user.clone(),
                        record: tokio::sync::RwLock::new(record),
                        refresh_gate: tokio::sync::Mutex::new(()),
                    }));
                }
                Ok(None) => {
                    warn!(event = "credential_missing", kind = %kind, user = %user);
                }
                Err(err) => {
                    warn!(event = "credential_load_failed", kind = %kind, user = %user, error = %err);
                }
            }
        }
        info!(event = "credential_pool_loaded", kind = %kind, count = loaded.len());
        self.entries.write().await.insert(kind.to_string(), loaded);
    }

    /// Persist tokens from a completed login and make the credential
    /// available immediately.
    pub async fn store_tokens(
        &self,
        kind: &str,
        user: &str,
        tokens: &TokenResponse,
    ) -> Result<(), GatewayError> {
        let record = CredentialRecord {
            provider_kind: kind.to_string(),
            user_identifier: user.to_string(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
            expires_at: now_unix() + tokens.expires_in.unwrap_or(0),
            metadata: serde_json::Value::Null,
        };
        self.store
            .upsert(record.clone())
            .await
            .map_err(|err| GatewayError::Internal(format!("credential persist failed: {err}")))?;

        let mut entries = self.entries.write().await;
        let list = entries.entry(kind.to_string()).or_default();
        match list.iter().find(|cred| cred.user == user) {
            Some(existing) => *existing.record.write().await = record,
            None => list.push(Arc::new(PooledCredential {
                kind: kind.to_string(),
                user: user.to_string(),
                record: tokio::sync::RwLock::new(record),
                refresh_gate: tokio::sync::Mutex::new(()),
            })),
        }
        Ok(())
    }

    /// Round-robin over credentials that (a) outlive the eligibility
    /// margin and (b) are not on a per-account cooldown for this
    /// provider.
    pub async fn take(
        &self,
        provider_id: &str,
        kind: &str,
    ) -> Result<Arc<PooledCredential>, GatewayError> {
        let entries = self.entries.read().await;
        let Some(list) = entries.get(kind) else {
            return Err(GatewayError::AllAccountsExhausted {
                kind: kind.to_string(),
            });
        };

        let cutoff = now_unix() + ELIGIBILITY_MARGIN.as_secs() as i64;
        let mut eligible = Vec::new();
        for credential in list {
            if credential.record.read().await.expires_at <= cutoff {
                continue;
            }
            if !self
                .cooldowns
                .healthy(&account_key(provider_id, &credential.user))
            {
                continue;
            }
            eligible.push(credential.clone());
        }
        if eligible.is_empty() {
            return Err(GatewayError::AllAccountsExhausted {
                kind: kind.to_string(),
            });
        }

        let index = {
            let Ok(mut cursors) = self.cursors.lock() else {
                return Ok(eligible[0].clone());
            };
            let cursor = cursors.entry(kind.to_string()).or_insert(0);
            let index = *cursor % eligible.len();
            *cursor = cursor.wrapping_add(1);
            index
        };
        Ok(eligible[index].clone())
    }

    /// Refresh when inside the family threshold. Serialized per
    /// credential: concurrent dispatches on the same account perform
    /// exactly one token call and both observe the new token.
    pub async fn refresh_if_needed(
        &self,
        credential: &Arc<PooledCredential>,
    ) -> Result<String, GatewayError> {
        let kind = OAuthKind::parse(&credential.kind).ok_or_else(|| {
            GatewayError::Internal(format!("unknown oauth kind {}", credential.kind))
        })?;
        let threshold = kind.refresh_threshold().as_secs() as i64;

        if credential.record.read().await.expires_at - now_unix() >= threshold {
            return Ok(credential.access_token().await);
        }

        let _gate = credential.refresh_gate.lock().await;
        // Re-check under the gate: a concurrent dispatch may have
        // already refreshed while this one waited.
        {
            let record = credential.record.read().await;
            if record.expires_at - now_unix() >= threshold {
                return Ok(record.access_token.clone());
            }
        }

        let refresh_token = credential.record.read().await.refresh_token.clone();
        let tokens = self
            .refresher
            .refresh_token(kind, &refresh_token)
            .await
            .map_err(|err| GatewayError::Internal(format!("oauth refresh failed: {err}")))?;

        let updated = {
            let mut record = credential.record.write().await;
            record.access_token = tokens.access_token.clone();
            if let Some(refresh_token) = tokens.refresh_token {
                record.refresh_token = refresh_token;
            }
            if let Some(expires_in) = tokens.expires_in {
                record.expires_at = now_unix() + expires_in;
            }
            record.clone()
        };
        if let Err(err) = self.store.upsert(updated).await {
            warn!(event = "credential_persist_failed", user = %credential.user, error = %err);
        }
        info!(event = "credential_refreshed", kind = %credential.kind, user = %credential.user);
        Ok(tokens.access_token)
    }

    /// One background cycle: refresh every credential inside its family
    /// threshold, at most `max_in_flight` concurrently. Failures are
    /// logged and do not cooldown the account; a later 401 at dispatch
    /// time does.
    pub async fn refresh_due(self: &Arc<Self>, max_in_flight: usize) {
        let due: Vec<Arc<PooledCredential>> = {
            let entries = self.entries.read().await;
            let now = now_unix();
            let mut due = Vec::new();
            for credentials in entries.values() {
                for credential in credentials {
                    let Some(kind) = OAuthKind::parse(&credential.kind) else {
                        continue;
                    };
                    let threshold = kind.refresh_threshold().as_secs() as i64;
                    if credential.record.read().await.expires_at - now < threshold {
                        due.push(credential.clone());
                    }
                }
            }
            due
        };
        if due.is_empty() {
            return;
        }

        let semaphore = Arc::new(tokio::sync::Semaphore::new(max_in_flight.max(1)));
        let mut tasks = Vec::new();
        for credential in due {
            let pool = self.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if let Err(err) = pool.refresh_if_needed(&credential).await {
                    warn!(
                        event = "background_refresh_failed",
                        kind = %credential.kind,
                        user = %credential.user,
                        error = %err,
                    );
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}
