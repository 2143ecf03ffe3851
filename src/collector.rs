use std::sync::Arc;
use std::time::Duration as StdDuration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::CollectConfig;
use crate::sources::VulnFeed;
use crate::store::Store;
use crate::types::{BotError, Result, SourceItem};

/// Pulls candidate source items on a fixed cadence. Each run fetches an
/// overlapping window (larger than the cadence) and filters out identifiers
/// already present in the local cache, so replaying overlapping windows
/// never yields a duplicate item.
pub struct Collector {
    feed: Arc<dyn VulnFeed>,
    store: Arc<Store>,
    config: CollectConfig,
}

impl Collector {
    pub fn new(feed: Arc<dyn VulnFeed>, store: Arc<Store>, config: CollectConfig) -> Self {
        Self { feed, store, config }
    }

    /// Collect new source items. Transport faults are retried with
    /// exponential backoff up to the configured attempt count; exhausting
    /// the budget fails this cycle only.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<Vec<SourceItem>> {
        let pruned = self
            .store
            .prune_source_cache(now - Duration::days(self.config.retention_days))
            .await?;
        if pruned > 0 {
            debug!("Pruned {pruned} expired source item(s) from cache");
        }

        let start = now - Duration::hours(self.config.window_hours);
        let fetched = self.fetch_with_retries(start, now).await?;

        let seen = self.store.cached_source_ids().await?;
        let new_items: Vec<SourceItem> = fetched
            .into_iter()
            .filter(|item| !seen.contains(&item.id))
            .collect();

        let inserted = self.store.cache_source_items(&new_items, now).await?;
        info!(
            source = %self.feed.source_name(),
            new = inserted,
            "Collection cycle complete"
        );
        Ok(new_items)
    }

    async fn fetch_with_retries(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SourceItem>> {
        let mut backoff = ExponentialBackoff {
            initial_interval: StdDuration::from_secs(self.config.retry_delay_secs),
            current_interval: StdDuration::from_secs(self.config.retry_delay_secs),
            max_interval: StdDuration::from_secs(self.config.retry_delay_secs * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = BotError::Transport("no fetch attempt made".to_string());
        for attempt in 1..=self.config.max_attempts {
            match self.feed.fetch_window(start, end).await {
                Ok(items) => return Ok(items),
                Err(e) if e.is_transport() => {
                    warn!(
                        source = %self.feed.source_name(),
                        attempt,
                        "Feed fetch failed: {e}"
                    );
                    last_error = e;
                    if attempt < self.config.max_attempts {
                        if let Some(delay) = backoff.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}
