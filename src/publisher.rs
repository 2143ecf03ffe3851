use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PublishConfig, RunMode};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::types::{BotError, Draft, PostRecord, Result};

/// A publishing backend. Returns the assigned external post id.
#[async_trait]
pub trait PostSink: Send + Sync {
    fn name(&self) -> String;

    async fn post(&self, body: &str, parent_id: Option<&str>) -> Result<String>;
}

/// Live sink for an X-style v2 posts API; thread parts reply-chain through
/// the parent id.
pub struct HttpSink {
    client: Client,
    api_url: String,
    token: String,
}

impl HttpSink {
    pub fn new(config: &PublishConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl PostSink for HttpSink {
    fn name(&self) -> String {
        "live".to_string()
    }

    async fn post(&self, body: &str, parent_id: Option<&str>) -> Result<String> {
        let mut payload = json!({ "text": body });
        if let Some(parent) = parent_id {
            payload["reply"] = json!({ "in_reply_to_tweet_id": parent });
        }

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotError::Transport(format!(
                "publishing backend returned HTTP {status}"
            )));
        }

        let body: Value = response.json().await?;
        body.get("data")
            .and_then(|d| d.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BotError::General("publish response missing post id".to_string()))
    }
}

/// Test-mode sink: logs the would-post content and returns a synthetic
/// success marker without touching the network.
pub struct LogSink;

#[async_trait]
impl PostSink for LogSink {
    fn name(&self) -> String {
        "test-log".to_string()
    }

    async fn post(&self, body: &str, parent_id: Option<&str>) -> Result<String> {
        info!(parent = ?parent_id, "WOULD POST: {body}");
        Ok(format!("test-{}", Uuid::new_v4()))
    }
}

/// Commits an approved draft. In live mode each part goes to the publishing
/// backend with bounded retries; exhausting them abandons the attempt with
/// no post record written, so a post that never went out cannot pollute
/// dedup or quota state. On success the records are appended atomically and
/// the scheduler is told exactly once.
pub struct Publisher {
    sink: Arc<dyn PostSink>,
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    mode: RunMode,
    count_test_posts: bool,
    max_retries: u32,
    retry_delay_secs: u64,
}

impl Publisher {
    pub fn new(
        sink: Arc<dyn PostSink>,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        mode: RunMode,
        count_test_posts: bool,
        config: &PublishConfig,
    ) -> Self {
        Self {
            sink,
            store,
            scheduler,
            mode,
            count_test_posts,
            max_retries: config.max_retries,
            retry_delay_secs: config.retry_delay_secs,
        }
    }

    pub async fn publish(&self, draft: &Draft, now: DateTime<Utc>) -> Result<Vec<PostRecord>> {
        let mut external_ids = Vec::with_capacity(draft.parts.len());
        let mut parent: Option<String> = None;

        for part in &draft.parts {
            let external_id = self.post_with_retries(part, parent.as_deref()).await?;
            parent = Some(external_id.clone());
            external_ids.push(external_id);
        }

        let records = build_records(draft, &external_ids, now);
        self.store.append_posts(&records).await?;

        let counts_quota = self.mode == RunMode::Live || self.count_test_posts;
        if counts_quota {
            self.scheduler.record_post(now).await?;
        }

        info!(
            sink = %self.sink.name(),
            parts = records.len(),
            counted = counts_quota,
            "Published"
        );
        Ok(records)
    }

    /// Retries weigh duplicate-post risk against lost-post risk: a small
    /// bounded budget, then the attempt is abandoned and surfaced.
    async fn post_with_retries(&self, body: &str, parent_id: Option<&str>) -> Result<String> {
        let mut backoff = ExponentialBackoff {
            initial_interval: StdDuration::from_secs(self.retry_delay_secs),
            current_interval: StdDuration::from_secs(self.retry_delay_secs),
            max_interval: StdDuration::from_secs(self.retry_delay_secs * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = BotError::Transport("no publish attempt made".to_string());
        for attempt in 1..=self.max_retries {
            match self.sink.post(body, parent_id).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transport() => {
                    warn!(sink = %self.sink.name(), attempt, "Publish transport fault: {e}");
                    last_error = e;
                    if attempt < self.max_retries {
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

/// Thread drafts share one thread id with contiguous 1-based positions;
/// single posts carry neither.
fn build_records(draft: &Draft, external_ids: &[String], now: DateTime<Utc>) -> Vec<PostRecord> {
    let thread_id = (draft.parts.len() > 1).then(Uuid::new_v4);
    draft
        .parts
        .iter()
        .zip(external_ids)
        .enumerate()
        .map(|(i, (content, external_id))| PostRecord {
            id: Uuid::new_v4(),
            created_at: now,
            content: content.clone(),
            concepts: draft.concepts.clone(),
            cve_ids: draft.cve_ids.clone(),
            technical_depth: draft.technical_depth,
            thread_id,
            thread_position: thread_id.map(|_| (i + 1) as i32),
            external_id: Some(external_id.clone()),
        })
        .collect()
}
