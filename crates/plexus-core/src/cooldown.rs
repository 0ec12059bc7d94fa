//! Per-provider (and per-account) health state with exponential backoff
//! and store-backed persistence.
//!
//! One mutex guards the live map. Persistence runs in spawned tasks
//! after the lock is released and is best-effort: a failed write is
//! logged, never raised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use plexus_storage::{CooldownEntry, CooldownStore};

#[derive(Debug, Clone, Copy)]
pub struct CooldownConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct CooldownState {
    expiry_epoch_ms: i64,
    reason: String,
    consecutive_failures: u32,
}

pub struct CooldownManager {
    config: CooldownConfig,
    entries: Mutex<HashMap<String, CooldownState>>,
    store: Arc<dyn CooldownStore>,
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl CooldownManager {
    /// Boot: load persisted entries, discard anything already expired
    /// (and delete it from the store), keep the active remainder live.
    pub async fn load(config: CooldownConfig, store: Arc<dyn CooldownStore>) -> Self {
        let mut live = HashMap::new();
        match store.load_all().await {
            Ok(entries) => {
                let now = now_ms();
                for entry in entries {
                    if entry.expiry_epoch_ms > now {
                        live.insert(
                            entry.key.clone(),
                            CooldownState {
                                expiry_epoch_ms: entry.expiry_epoch_ms,
                                reason: entry.reason,
                                consecutive_failures: entry.consecutive_failures,
                            },
                        );
                    } else {
                        let store = store.clone();
                        let key = entry.key.clone();
                        tokio::spawn(async move {
                            if let Err(err) = store.delete(&key).await {
                                warn!(event = "cooldown_persist_failed", key = %key, error = %err);
                            }
                        });
                    }
                }
            }
            Err(err) => warn!(event = "cooldown_load_failed", error = %err),
        }
        Self {
            config,
            entries: Mutex::new(live),
            store,
        }
    }

    /// True when no entry exists or it has expired. Expired entries are
    /// dropped on observation, keeping the invariant that the live map
    /// only holds future expiries.
    pub fn healthy(&self, key: &str) -> bool {
        let mut expired = false;
        let healthy = {
            let Ok(mut guard) = self.entries.lock() else {
                return true;
            };
            match guard.get(key) {
                None => true,
                Some(state) if state.expiry_epoch_ms <= now_ms() => {
                    guard.remove(key);
                    expired = true;
                    true
                }
                Some(_) => false,
            }
        };
        if expired {
            self.spawn_delete(key.to_string());
        }
        healthy
    }

    /// Record a failure; returns the cooldown window applied:
    /// `min(base * 2^(n-1), cap)` over consecutive failures.
    pub fn mark_failure(&self, key: &str, reason: &str) -> Duration {
        let entry = {
            let Ok(mut guard) = self.entries.lock() else {
                return self.config.base;
            };
            let failures = guard
                .get(key)
                .map(|state| state.consecutive_failures)
                .unwrap_or(0)
                .saturating_add(1);
            let duration = backoff(self.config, failures);
            let state = CooldownState {
                expiry_epoch_ms: now_ms() + duration.as_millis() as i64,
                reason: reason.to_string(),
                consecutive_failures: failures,
            };
            guard.insert(key.to_string(), state.clone());
            CooldownEntry {
                key: key.to_string(),
                expiry_epoch_ms: state.expiry_epoch_ms,
                reason: state.reason,
                consecutive_failures: state.consecutive_failures,
            }
        };
        info!(
            event = "cooldown_set",
            key = %entry.key,
            reason = %entry.reason,
            failures = entry.consecutive_failures,
            until_ms = entry.expiry_epoch_ms,
        );
        let duration = backoff(self.config, entry.consecutive_failures);
        self.spawn_upsert(entry);
        duration
    }

    /// Clear the failure counter and any active cooldown.
    pub fn mark_success(&self, key: &str) {
        let removed = {
            let Ok(mut guard) = self.entries.lock() else {
                return;
            };
            guard.remove(key).is_some()
        };
        if removed {
            info!(event = "cooldown_cleared", key = %key);
            self.spawn_delete(key.to_string());
        }
    }

    /// Copy-on-read view of the active entries.
    pub fn active_entries(&self) -> Vec<CooldownEntry> {
        let Ok(guard) = self.entries.lock() else {
            return Vec::new();
        };
        let now = now_ms();
        let mut entries: Vec<CooldownEntry> = guard
            .iter()
            .filter(|(_, state)| state.expiry_epoch_ms > now)
            .map(|(key, state)| CooldownEntry {
                key: key.clone(),
                expiry_epoch_ms: state.expiry_epoch_ms,
                reason: state.reason.clone(),
                consecutive_failures: state.consecutive_failures,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn clear_all(&self) {
        let keys: Vec<String> = {
            let Ok(mut guard) = self.entries.lock() else {
                return;
            };
            let keys = guard.keys().cloned().collect();
            guard.clear();
            keys
        };
        for key in keys {
            self.spawn_delete(key);
        }
    }

    fn spawn_upsert(&self, entry: CooldownEntry) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let key = entry.key.clone();
            if let Err(err) = store.upsert(entry).await {
                warn!(event = "cooldown_persist_failed", key = %key, error = %err);
            }
        });
    }

    fn spawn_delete(&self, key: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.delete(&key).await {
                warn!(event = "cooldown_persist_failed", key = %key, error = %err);
            }
        });
    }
}

fn backoff(config: CooldownConfig, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(31);
    let scaled = config.base.saturating_mul(2u32.saturating_pow(exponent));
    scaled.min(config.cap)
}

/// Cooldown key for a provider/account pair.
pub fn account_key(provider_id: &str, account_email: &str) -> String {
    format!("{provider_id}#{account_email}")
}
