use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cve_poster::config::CollectConfig;
use cve_poster::types::{BotError, Result, SourceItem};
use cve_poster::{Collector, Store, VulnFeed};

/// Feed that replays a script of per-call outcomes.
struct ScriptedFeed {
    batches: tokio::sync::Mutex<VecDeque<Result<Vec<SourceItem>>>>,
}

impl ScriptedFeed {
    fn new(batches: Vec<Result<Vec<SourceItem>>>) -> Self {
        Self {
            batches: tokio::sync::Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl VulnFeed for ScriptedFeed {
    fn source_name(&self) -> String {
        "scripted".to_string()
    }

    async fn fetch_window(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<SourceItem>> {
        self.batches
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(BotError::Transport("script exhausted".to_string())))
    }
}

fn config() -> CollectConfig {
    CollectConfig {
        window_hours: 48,
        cadence_secs: 86_400,
        max_attempts: 3,
        retry_delay_secs: 0,
        retention_days: 14,
    }
}

fn item(id: &str) -> SourceItem {
    SourceItem {
        id: id.to_string(),
        published_at: Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap(),
        description: "A race condition in the widget driver".to_string(),
        severity: Some(8.1),
        references: vec![],
        writeups: vec!["https://blog.example.com/widget".to_string()],
        interesting_factors: vec!["race condition".to_string()],
    }
}

#[tokio::test]
async fn overlapping_windows_never_duplicate_items() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let feed = Arc::new(ScriptedFeed::new(vec![
        Ok(vec![item("CVE-2024-0001"), item("CVE-2024-0002")]),
        // Second run covers an overlapping window: one repeat, one new.
        Ok(vec![item("CVE-2024-0002"), item("CVE-2024-0003")]),
    ]));
    let collector = Collector::new(feed, store.clone(), config());

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap();
    let first = collector.collect(now).await.unwrap();
    assert_eq!(first.len(), 2);

    let second = collector
        .collect(now + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, "CVE-2024-0003");

    assert_eq!(store.cached_source_ids().await.unwrap().len(), 3);
}

#[tokio::test]
async fn transport_faults_are_retried() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let feed = Arc::new(ScriptedFeed::new(vec![
        Err(BotError::Transport("connection reset".to_string())),
        Err(BotError::Transport("connection reset".to_string())),
        Ok(vec![item("CVE-2024-0010")]),
    ]));
    let collector = Collector::new(feed, store, config());

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap();
    let items = collector.collect(now).await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn exhausting_the_attempt_budget_fails_the_cycle() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let feed = Arc::new(ScriptedFeed::new(vec![
        Err(BotError::Transport("down".to_string())),
        Err(BotError::Transport("down".to_string())),
        Err(BotError::Transport("down".to_string())),
    ]));
    let collector = Collector::new(feed, store.clone(), config());

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap();
    let result = collector.collect(now).await;
    assert!(matches!(result, Err(BotError::Transport(_))));

    // A failed cycle leaves no partial state behind.
    assert!(store.cached_source_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_cache_rows_are_pruned() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let old_fetch = Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap();
    store
        .cache_source_items(&[item("CVE-2024-0020")], old_fetch)
        .await
        .unwrap();

    let feed = Arc::new(ScriptedFeed::new(vec![Ok(vec![])]));
    let collector = Collector::new(feed, store.clone(), config());
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap();
    collector.collect(now).await.unwrap();

    assert!(store.cached_source_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn source_items_round_trip_through_the_cache() {
    let store = Store::in_memory().await.unwrap();
    let original = item("CVE-2024-0030");
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap();
    store.cache_source_items(&[original.clone()], now).await.unwrap();

    let loaded = store.get_source_item("CVE-2024-0030").await.unwrap().unwrap();
    assert_eq!(loaded, original);
}
