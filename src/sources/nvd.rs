use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::VulnFeed;
use crate::types::{BotError, Result, SourceItem};

/// Description patterns that mark an item as worth covering. The short label
/// doubles as a concept tag for dedup and content-mix accounting.
const INTERESTING_PATTERNS: &[&str] = &[
    "race condition",
    "buffer overflow",
    "use after free",
    "privilege escalation",
    "remote code execution",
    "zero-day",
    "sandbox escape",
    "authentication bypass",
];

/// Reference URL fragments that usually point at a technical writeup rather
/// than a vendor advisory stub.
const WRITEUP_DOMAINS: &[&str] = &[
    "github.com",
    "hackerone.com",
    "bugzilla",
    "exploit-db.com",
    "research.",
    "blog.",
    "advisory",
];

/// Client for the NVD CVE JSON API. Respects the API's request spacing by
/// delaying between calls.
pub struct NvdClient {
    client: Client,
    base_url: String,
    request_delay: Duration,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl NvdClient {
    pub fn new(base_url: String, request_delay_secs: u64, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent("cve-poster/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            base_url,
            request_delay: Duration::from_secs(request_delay_secs),
            last_request: tokio::sync::Mutex::new(None),
        })
    }

    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn parse_vulnerability(raw: &Value) -> Result<SourceItem> {
        let cve = raw
            .get("cve")
            .ok_or_else(|| BotError::General("missing 'cve' field in NVD record".to_string()))?;

        let id = cve
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BotError::General("missing CVE id in NVD record".to_string()))?
            .to_string();

        let published_at = cve
            .get("published")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(&normalize_nvd_timestamp(s)).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| BotError::General(format!("bad published date for {id}")))?;

        let description = cve
            .get("descriptions")
            .and_then(Value::as_array)
            .and_then(|descs| {
                descs
                    .iter()
                    .find(|d| d.get("lang").and_then(Value::as_str) == Some("en"))
                    .or_else(|| descs.first())
            })
            .and_then(|d| d.get("value"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let references: Vec<String> = cve
            .get("references")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r.get("url").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let writeups = references
            .iter()
            .filter(|url| {
                let url = url.to_lowercase();
                WRITEUP_DOMAINS.iter().any(|d| url.contains(d))
            })
            .cloned()
            .collect();

        let desc_lower = description.to_lowercase();
        let interesting_factors = INTERESTING_PATTERNS
            .iter()
            .filter(|p| desc_lower.contains(**p))
            .map(|p| p.to_string())
            .collect();

        Ok(SourceItem {
            id,
            published_at,
            description,
            severity: extract_cvss_score(cve),
            references,
            writeups,
            interesting_factors,
        })
    }
}

#[async_trait]
impl VulnFeed for NvdClient {
    fn source_name(&self) -> String {
        "nvd".to_string()
    }

    async fn fetch_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SourceItem>> {
        self.wait_for_rate_limit().await;

        let format = "%Y-%m-%dT%H:%M:%S%.3f";
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("pubStartDate", start.format(format).to_string()),
                ("pubEndDate", end.format(format).to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotError::Transport(format!("NVD API returned HTTP {status}")));
        }

        let body: Value = response.json().await?;
        let vulnerabilities = body
            .get("vulnerabilities")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                BotError::General("no 'vulnerabilities' field in NVD response".to_string())
            })?;

        let mut items = Vec::new();
        for raw in vulnerabilities {
            match Self::parse_vulnerability(raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping malformed NVD record: {e}"),
            }
        }
        debug!("Fetched {} item(s) from NVD", items.len());
        Ok(items)
    }
}

/// CVSS v3.1 first, then v3.0, then v2.
fn extract_cvss_score(cve: &Value) -> Option<f64> {
    let metrics = cve.get("metrics")?;
    for key in ["cvssMetricV31", "cvssMetricV30", "cvssMetricV2"] {
        if let Some(score) = metrics
            .get(key)
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .and_then(|m| m.get("cvssData"))
            .and_then(|d| d.get("baseScore"))
            .and_then(Value::as_f64)
        {
            return Some(score);
        }
    }
    None
}

/// NVD timestamps come without a zone suffix in some fields; treat bare
/// timestamps as UTC so rfc3339 parsing accepts them.
fn normalize_nvd_timestamp(s: &str) -> String {
    if s.ends_with('Z') || s.contains('+') || s.rfind('-') > Some(9) {
        s.replace('Z', "+00:00")
    } else {
        format!("{s}+00:00")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nvd_record_with_cvss_fallback() {
        let raw = json!({
            "cve": {
                "id": "CVE-2024-1234",
                "published": "2024-03-01T10:00:00.000",
                "descriptions": [
                    {"lang": "en", "value": "A race condition in the kernel allows privilege escalation."}
                ],
                "references": [
                    {"url": "https://blog.example.com/kernel-race"},
                    {"url": "https://vendor.example.com/advisory-123"}
                ],
                "metrics": {
                    "cvssMetricV30": [
                        {"cvssData": {"baseScore": 7.8}}
                    ]
                }
            }
        });

        let item = NvdClient::parse_vulnerability(&raw).unwrap();
        assert_eq!(item.id, "CVE-2024-1234");
        assert_eq!(item.severity, Some(7.8));
        assert_eq!(item.writeups.len(), 2);
        assert!(item
            .interesting_factors
            .contains(&"race condition".to_string()));
        assert!(item
            .interesting_factors
            .contains(&"privilege escalation".to_string()));
    }

    #[test]
    fn missing_id_is_an_error() {
        let raw = json!({"cve": {"published": "2024-03-01T10:00:00.000"}});
        assert!(NvdClient::parse_vulnerability(&raw).is_err());
    }
}
