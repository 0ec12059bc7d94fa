pub mod memory;
pub mod records;
pub mod stats;
pub mod stores;

pub use memory::{MemoryCooldownStore, MemoryCredentialStore, MemoryUsageStore};
pub use records::{CooldownEntry, CredentialRecord, UsageRecord};
pub use stats::{RollingStats, TargetSnapshot};
pub use stores::{CooldownStore, CredentialStore, StorageError, StorageResult, UsageStore};
