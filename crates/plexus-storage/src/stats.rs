use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use time::OffsetDateTime;

/// Read-only per-target view handed to selectors. Copy-on-read: selector
/// decisions never hold the stats lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetSnapshot {
    pub avg_duration_ms: Option<f64>,
    pub avg_tokens_per_second: Option<f64>,
    pub last_success_at: Option<OffsetDateTime>,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct TargetWindow {
    durations_ms: VecDeque<u64>,
    tokens_per_second: VecDeque<f64>,
    last_success_at: Option<OffsetDateTime>,
    samples: usize,
}

impl TargetWindow {
    fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            avg_duration_ms: average(self.durations_ms.iter().map(|&v| v as f64)),
            avg_tokens_per_second: average(self.tokens_per_second.iter().copied()),
            last_success_at: self.last_success_at,
            samples: self.samples,
        }
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}

/// Rolling window statistics per `(provider_id, model_slug)`, refreshed
/// on every usage-record insertion.
#[derive(Debug)]
pub struct RollingStats {
    window: usize,
    targets: RwLock<HashMap<(String, String), TargetWindow>>,
}

impl RollingStats {
    pub const DEFAULT_WINDOW: usize = 100;

    pub fn new(window: usize) -> Self {
        Self {
            window,
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(
        &self,
        provider_id: &str,
        model_slug: &str,
        at: OffsetDateTime,
        duration_ms: u64,
        output_tokens: Option<u64>,
        success: bool,
    ) {
        let Ok(mut guard) = self.targets.write() else {
            return;
        };
        let window = guard
            .entry((provider_id.to_string(), model_slug.to_string()))
            .or_default();
        window.samples += 1;
        push_bounded(&mut window.durations_ms, duration_ms, self.window);
        if let Some(tokens) = output_tokens
            && duration_ms > 0
        {
            push_bounded(
                &mut window.tokens_per_second,
                tokens as f64 * 1000.0 / duration_ms as f64,
                self.window,
            );
        }
        if success {
            window.last_success_at = Some(at);
        }
    }

    pub fn target(&self, provider_id: &str, model_slug: &str) -> Option<TargetSnapshot> {
        let guard = self.targets.read().ok()?;
        guard
            .get(&(provider_id.to_string(), model_slug.to_string()))
            .map(TargetWindow::snapshot)
    }

    pub fn snapshot(&self) -> HashMap<(String, String), TargetSnapshot> {
        match self.targets.read() {
            Ok(guard) => guard
                .iter()
                .map(|(key, window)| (key.clone(), window.snapshot()))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded_and_averaged() {
        let stats = RollingStats::new(3);
        let now = OffsetDateTime::UNIX_EPOCH;
        for duration in [100, 200, 300, 400] {
            stats.observe("p", "m", now, duration, Some(duration), true);
        }
        let snapshot = stats.target("p", "m").unwrap();
        // Window of 3 keeps 200, 300, 400.
        assert_eq!(snapshot.avg_duration_ms, Some(300.0));
        assert_eq!(snapshot.samples, 4);
        assert_eq!(snapshot.avg_tokens_per_second, Some(1000.0));
    }

    #[test]
    fn unseen_targets_have_no_snapshot() {
        let stats = RollingStats::default();
        assert!(stats.target("p", "missing").is_none());
    }
}
