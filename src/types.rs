use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A published (or test-mode logged) post. Immutable once written; the
/// history store only ever appends these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub content: String,
    /// Ordered concept tags covered by this post, used for overlap scoring.
    pub concepts: Vec<String>,
    /// CVE identifiers this post references.
    pub cve_ids: Vec<String>,
    /// Technical depth on a 1-5 scale.
    pub technical_depth: i32,
    /// Set when the post is part of a thread; all parts share one id.
    pub thread_id: Option<Uuid>,
    /// 1-based position within the thread, contiguous with no gaps.
    pub thread_position: Option<i32>,
    /// Identifier assigned by the publishing backend, or a synthetic
    /// marker in test mode.
    pub external_id: Option<String>,
}

/// A vulnerability record pulled from the feed backend. Transient: kept in
/// a bounded cache only long enough to dedupe overlapping fetch windows and
/// drive candidate selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceItem {
    /// CVE-YYYY-NNNNN
    pub id: String,
    pub published_at: DateTime<Utc>,
    pub description: String,
    /// CVSS base score when the feed provides one.
    pub severity: Option<f64>,
    /// All reference URLs from the advisory.
    pub references: Vec<String>,
    /// Subset of references that look like technical writeups.
    pub writeups: Vec<String>,
    /// Short labels for patterns that make this item worth covering
    /// ("race condition", "use after free", ...). These double as
    /// candidate concept tags.
    pub interesting_factors: Vec<String>,
}

/// An approved draft handed from the generation pipeline to the publish
/// pipeline. Multi-part drafts become a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub parts: Vec<String>,
    pub concepts: Vec<String>,
    pub cve_ids: Vec<String>,
    pub technical_depth: i32,
}

/// Durable scheduling counters. Mutated only by `Scheduler::record_post`;
/// day/month rollover is computed lazily against `counted_date` on every
/// gate check, so missed resets from sleep or crash gaps cannot occur.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleState {
    pub last_post_at: Option<DateTime<Utc>>,
    pub posts_today: u32,
    pub posts_this_month: u32,
    /// Date (in the bot's reference timezone) the counters were last valid for.
    pub counted_date: NaiveDate,
}

impl ScheduleState {
    pub fn fresh(today: NaiveDate) -> Self {
        Self {
            last_post_at: None,
            posts_today: 0,
            posts_this_month: 0,
            counted_date: today,
        }
    }
}

/// Outcome of a scheduling gate check. Denials are expected outcomes, not
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    Denied(DeniedReason),
}

/// Reasons a post is not allowed right now, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedReason {
    OutsideWindow,
    MinInterval,
    DailyCeiling,
    MonthlyCeiling,
}

impl std::fmt::Display for DeniedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeniedReason::OutsideWindow => "outside posting window",
            DeniedReason::MinInterval => "minimum interval not elapsed",
            DeniedReason::DailyCeiling => "daily ceiling reached",
            DeniedReason::MonthlyCeiling => "monthly ceiling reached",
        };
        f.write_str(s)
    }
}

/// Verdict from the dedup checker.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Allowed,
    Rejected { overlap: f64 },
}

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("transport fault: {0}")]
    Transport(String),

    #[error("draft rejected: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("persisted state corrupt: {0}")]
    StateCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("{0}")]
    General(String),
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Transport(e.to_string())
    }
}

impl BotError {
    /// Transport faults are retried with backoff; everything else is not.
    pub fn is_transport(&self) -> bool {
        matches!(self, BotError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
