use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

/// Engine operation counters. Cheap to clone and safe to read from
/// monitoring loops while workers run.
#[derive(Clone, Default)]
pub struct EngineMetrics {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: usize,
    pub processed: usize,
    pub failed: usize,
    pub dropped: usize,
    pub replayed: usize,
    pub commit_retries: usize,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, updater: F)
    where
        F: FnOnce(&mut MetricsSnapshot),
    {
        if let Ok(mut inner) = self.inner.lock() {
            updater(&mut inner);
        }
    }

    pub fn record_submitted(&self) {
        self.update(|counters| counters.submitted += 1);
    }

    pub fn record_processed(&self) {
        self.update(|counters| counters.processed += 1);
    }

    pub fn record_failed(&self) {
        self.update(|counters| counters.failed += 1);
    }

    pub fn record_dropped(&self) {
        self.update(|counters| counters.dropped += 1);
    }

    pub fn record_replayed(&self) {
        self.update(|counters| counters.replayed += 1);
    }

    pub fn record_commit_retry(&self) {
        self.update(|counters| counters.commit_retries += 1);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|inner| inner.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_processed();
        metrics.record_failed();
        metrics.record_dropped();
        metrics.record_replayed();
        metrics.record_commit_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.replayed, 1);
        assert_eq!(snapshot.commit_retries, 1);
    }

    #[test]
    fn clones_share_the_same_counters() {
        let metrics = EngineMetrics::new();
        let clone = metrics.clone();
        clone.record_processed();
        assert_eq!(metrics.snapshot().processed, 1);
    }
}
