use async_trait::async_trait;

use crate::records::{CooldownEntry, CredentialRecord, UsageRecord};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Append-only usage sink. Inserts must never block the request path for
/// long: implementations may buffer and flush in the background, and the
/// newest second of records may be lost on crash.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: UsageRecord) -> StorageResult<()>;
}

/// Persistence for cooldown state across restarts. The cooldown manager
/// owns the live map; the store only sees active entries.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn load_all(&self) -> StorageResult<Vec<CooldownEntry>>;
    async fn upsert(&self, entry: CooldownEntry) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Persistence for OAuth credentials, at most one per
/// `(provider_kind, user_identifier)`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(
        &self,
        provider_kind: &str,
        user_identifier: &str,
    ) -> StorageResult<Option<CredentialRecord>>;
    async fn list(&self, provider_kind: &str) -> StorageResult<Vec<CredentialRecord>>;
    async fn upsert(&self, record: CredentialRecord) -> StorageResult<()>;
    async fn delete(&self, provider_kind: &str, user_identifier: &str) -> StorageResult<()>;
}
