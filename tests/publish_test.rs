use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use cve_poster::config::{PostingConfig, PublishConfig, QuotaPolicy, RunMode};
use cve_poster::types::{BotError, Draft, Result, ScheduleState};
use cve_poster::{LogSink, PostSink, Publisher, Scheduler, Store};

struct FailingSink;

#[async_trait]
impl PostSink for FailingSink {
    fn name(&self) -> String {
        "failing".to_string()
    }

    async fn post(&self, _body: &str, _parent_id: Option<&str>) -> Result<String> {
        Err(BotError::Transport("backend unreachable".to_string()))
    }
}

fn posting_rules() -> PostingConfig {
    PostingConfig {
        windows: vec![(
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
        )],
        min_interval_minutes: 90,
        max_per_day: 3,
        max_per_month: 60,
        timezone: chrono_tz::UTC,
        count_test_posts: false,
        quota_policy: QuotaPolicy::FailOpen,
    }
}

fn publish_config() -> PublishConfig {
    PublishConfig {
        api_url: String::new(),
        token: String::new(),
        timeout_secs: 5,
        max_retries: 3,
        retry_delay_secs: 0,
    }
}

fn thread_draft() -> Draft {
    Draft {
        parts: vec![
            "1 of 3: the hook".to_string(),
            "2 of 3: the details".to_string(),
            "3 of 3: the lesson".to_string(),
        ],
        concepts: vec!["race condition".to_string(), "kernel".to_string()],
        cve_ids: vec!["CVE-2024-1234".to_string()],
        technical_depth: 4,
    }
}

async fn setup(
    sink: Arc<dyn PostSink>,
    mode: RunMode,
    count_test_posts: bool,
) -> (Arc<Store>, Arc<Scheduler>, Publisher) {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
    let scheduler = Arc::new(Scheduler::with_state(
        store.clone(),
        posting_rules(),
        ScheduleState::fresh(today),
    ));
    let publisher = Publisher::new(
        sink,
        store.clone(),
        scheduler.clone(),
        mode,
        count_test_posts,
        &publish_config(),
    );
    (store, scheduler, publisher)
}

#[tokio::test]
async fn live_backend_failure_leaves_no_trace() {
    let (store, scheduler, publisher) =
        setup(Arc::new(FailingSink), RunMode::Live, false).await;
    let before = scheduler.state_snapshot().await;

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let result = publisher.publish(&thread_draft(), now).await;
    assert!(matches!(result, Err(BotError::Transport(_))));

    // A post that never went out must not pollute dedup or quota state.
    assert!(store.recent_posts(10).await.unwrap().is_empty());
    assert_eq!(scheduler.state_snapshot().await, before);
}

#[tokio::test]
async fn test_mode_thread_creates_contiguous_records() {
    let (store, scheduler, publisher) = setup(Arc::new(LogSink), RunMode::Test, false).await;

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let records = publisher.publish(&thread_draft(), now).await.unwrap();
    assert_eq!(records.len(), 3);

    let thread_id = records[0].thread_id.expect("thread parts share a thread id");
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.thread_id, Some(thread_id));
        assert_eq!(record.thread_position, Some((i + 1) as i32));
        assert!(record.external_id.as_deref().unwrap().starts_with("test-"));
    }

    // History stays consistent for dedup even in test mode...
    assert_eq!(store.recent_posts(10).await.unwrap().len(), 3);
    assert!(store.is_source_used("CVE-2024-1234").await.unwrap());
    // ...but quota is not consumed by default.
    assert_eq!(scheduler.state_snapshot().await.posts_today, 0);
}

#[tokio::test]
async fn counting_test_posts_is_configurable() {
    let (_store, scheduler, publisher) = setup(Arc::new(LogSink), RunMode::Test, true).await;

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    publisher.publish(&thread_draft(), now).await.unwrap();

    let snapshot = scheduler.state_snapshot().await;
    assert_eq!(snapshot.posts_today, 1);
    assert_eq!(snapshot.last_post_at, Some(now));
}

#[tokio::test]
async fn single_posts_carry_no_thread_fields() {
    let (store, _scheduler, publisher) = setup(Arc::new(LogSink), RunMode::Test, false).await;

    let draft = Draft {
        parts: vec!["one standalone post".to_string()],
        concepts: vec!["sandbox escape".to_string()],
        cve_ids: vec!["CVE-2024-0042".to_string()],
        technical_depth: 2,
    };
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let records = publisher.publish(&draft, now).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].thread_id, None);
    assert_eq!(records[0].thread_position, None);
    assert_eq!(store.recent_posts(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn post_records_round_trip_losslessly() {
    let (store, _scheduler, publisher) = setup(Arc::new(LogSink), RunMode::Test, false).await;

    let draft = Draft {
        parts: vec!["a post about heap grooming".to_string()],
        concepts: vec!["heap".to_string(), "memory corruption".to_string()],
        cve_ids: vec!["CVE-2024-7777".to_string(), "CVE-2024-7778".to_string()],
        technical_depth: 5,
    };
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let written = publisher.publish(&draft, now).await.unwrap();

    let read_back = store.get_post(written[0].id).await.unwrap().unwrap();
    assert_eq!(read_back, written[0]);
    assert_eq!(read_back.concepts, draft.concepts);
    assert_eq!(read_back.cve_ids, draft.cve_ids);
    assert_eq!(read_back.technical_depth, 5);
}
