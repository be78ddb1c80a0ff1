//! Hourly stats aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use pushfan_core::{MessageStatsBucket, StatsCounters, StatsKey, StatsStore, WebPushEvent};
use tracing::{debug, error};

/// Folds raw events into `(domain, message, hour)` buckets.
///
/// Buckets come out ordered by key, so concurrent writers touch rows in the
/// same order.
pub fn aggregate(events: &[WebPushEvent]) -> Vec<MessageStatsBucket> {
    let mut groups: BTreeMap<StatsKey, StatsCounters> = BTreeMap::new();
    for event in events {
        groups
            .entry(StatsKey::for_event(event))
            .or_default()
            .record(event);
    }

    groups
        .into_iter()
        .map(|(key, counters)| MessageStatsBucket { key, counters })
        .collect()
}

/// Applies event batches to the stats store as atomic increments.
#[derive(Clone)]
pub struct StatsAggregator {
    stats: Arc<dyn StatsStore>,
}

impl StatsAggregator {
    pub fn new(stats: Arc<dyn StatsStore>) -> Self {
        Self { stats }
    }

    /// Best-effort: failures are logged and swallowed.
    pub async fn register_stats(&self, events: &[WebPushEvent]) {
        if events.is_empty() {
            return;
        }

        let buckets = aggregate(events);
        match self.stats.increment_buckets(&buckets).await {
            Ok(()) => debug!(
                events = events.len(),
                buckets = buckets.len(),
                "Registered message stats"
            ),
            Err(e) => error!(
                error = %e,
                groups = buckets.len(),
                events = events.len(),
                "Failed to register message stats"
            ),
        }
    }
}
