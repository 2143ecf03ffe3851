pub mod nvd;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Result, SourceItem};

/// A vulnerability feed backend. The consumer owns retry policy and must
/// tolerate the same identifier appearing in overlapping windows.
#[async_trait]
pub trait VulnFeed: Send + Sync {
    /// Human-readable name for failure attribution.
    fn source_name(&self) -> String;

    /// Fetch items published inside the given window.
    async fn fetch_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SourceItem>>;
}
