//! Usage accounting: one row per dispatch, rolling selector statistics
//! refreshed on insertion.

use std::sync::Arc;

use tracing::warn;

use plexus_storage::{RollingStats, UsageRecord, UsageStore};
use plexus_transform::UnifiedUsage;

#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn UsageStore>,
    stats: Arc<RollingStats>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn UsageStore>, stats: Arc<RollingStats>) -> Self {
        Self { store, stats }
    }

    pub fn stats(&self) -> &Arc<RollingStats> {
        &self.stats
    }

    /// Append the record and refresh the per-target window. Records are
    /// appended in completion order; a failed append is logged, never
    /// surfaced to the request path.
    pub async fn record(&self, record: UsageRecord) {
        if let (Some(provider), Some(slug)) = (
            record.selected_provider.as_deref(),
            record.selected_model_slug.as_deref(),
        ) {
            self.stats.observe(
                provider,
                slug,
                record.at,
                record.duration_ms.max(0) as u64,
                record.output_tokens.and_then(|v| u64::try_from(v).ok()),
                record.response_status == "200",
            );
        }
        if let Err(err) = self.store.append(record).await {
            warn!(event = "usage_append_failed", error = %err);
        }
    }
}

/// Copy normalized token counts onto a usage record.
pub fn apply_usage(record: &mut UsageRecord, usage: &UnifiedUsage) {
    record.input_tokens = Some(usage.input_tokens as i64);
    record.output_tokens = Some(usage.output_tokens as i64);
    record.reasoning_tokens = Some(usage.reasoning_tokens as i64);
    record.cache_read_tokens = Some(usage.cache_read_tokens as i64);
    record.cache_creation_tokens = Some(usage.cache_creation_tokens as i64);
    record.total_tokens = Some(usage.total_tokens as i64);
}
