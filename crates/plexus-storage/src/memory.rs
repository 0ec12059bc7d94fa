//! In-memory store implementations: the default boot configuration and
//! the fixtures every async test drives.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::records::{CooldownEntry, CredentialRecord, UsageRecord};
use crate::stores::{CooldownStore, CredentialStore, StorageResult, UsageStore};

#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    rows: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<UsageRecord> {
        self.rows.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append(&self, record: UsageRecord) -> StorageResult<()> {
        self.rows.write().await.push(record);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCooldownStore {
    entries: RwLock<HashMap<String, CooldownEntry>>,
}

impl MemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store before boot, for restart tests.
    pub async fn seed(&self, entries: Vec<CooldownEntry>) {
        let mut guard = self.entries.write().await;
        for entry in entries {
            guard.insert(entry.key.clone(), entry);
        }
    }
}

#[async_trait]
impl CooldownStore for MemoryCooldownStore {
    async fn load_all(&self) -> StorageResult<Vec<CooldownEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn upsert(&self, entry: CooldownEntry) -> StorageResult<()> {
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<(String, String), CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: Vec<CredentialRecord>) {
        let mut guard = self.records.write().await;
        for record in records {
            guard.insert(
                (record.provider_kind.clone(), record.user_identifier.clone()),
                record,
            );
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(
        &self,
        provider_kind: &str,
        user_identifier: &str,
    ) -> StorageResult<Option<CredentialRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(provider_kind.to_string(), user_identifier.to_string()))
            .cloned())
    }

    async fn list(&self, provider_kind: &str) -> StorageResult<Vec<CredentialRecord>> {
        let mut rows: Vec<CredentialRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.provider_kind == provider_kind)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.user_identifier.cmp(&b.user_identifier));
        Ok(rows)
    }

    async fn upsert(&self, record: CredentialRecord) -> StorageResult<()> {
        self.records.write().await.insert(
            (record.provider_kind.clone(), record.user_identifier.clone()),
            record,
        );
        Ok(())
    }

    async fn delete(&self, provider_kind: &str, user_identifier: &str) -> StorageResult<()> {
        self.records
            .write()
            .await
            .remove(&(provider_kind.to_string(), user_identifier.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credential_upsert_replaces_by_identity() {
        let store = MemoryCredentialStore::new();
        let record = CredentialRecord {
            provider_kind: "claude-code".into(),
            user_identifier: "a@example.com".into(),
            access_token: "tok1".into(),
            refresh_token: "ref1".into(),
            expires_at: 100,
            metadata: serde_json::Value::Null,
        };
        store.upsert(record.clone()).await.unwrap();
        store
            .upsert(CredentialRecord {
                access_token: "tok2".into(),
                ..record.clone()
            })
            .await
            .unwrap();

        let rows = store.list("claude-code").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].access_token, "tok2");
    }
}
