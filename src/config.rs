use std::env;
use std::str::FromStr;

use chrono::NaiveTime;
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Whether publishes go to the real backend or a logged sink. Read once at
/// process start so a cycle can never straddle a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Log the would-post content, never call the publishing backend.
    Test,
    /// Post to the real publishing backend.
    Live,
}

/// What to do when persisting updated schedule state fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Keep posting with in-memory counters for the rest of the process
    /// lifetime (availability over perfect quota accuracy across restarts).
    FailOpen,
    /// Treat the publish as failed so quotas are never undercounted.
    FailClosed,
}

#[derive(Debug, Clone)]
pub struct PostingConfig {
    /// Daily wall-clock windows in the reference timezone; start inclusive,
    /// end exclusive.
    pub windows: Vec<(NaiveTime, NaiveTime)>,
    pub min_interval_minutes: i64,
    pub max_per_day: u32,
    pub max_per_month: u32,
    pub timezone: Tz,
    /// Whether test-mode publishes consume quota.
    pub count_test_posts: bool,
    pub quota_policy: QuotaPolicy,
}

#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// Fetch window, larger than the cadence to tolerate upstream
    /// publication delay and clock skew.
    pub window_hours: i64,
    pub cadence_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// How long source items stay in the local cache.
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Rolling count of recent posts forming the concept history window.
    pub window_size: usize,
    /// Overlap score above which repetition must go strictly deeper.
    pub overlap_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Items whose description matches any of these are never posted about.
    pub denylist: Vec<String>,
    /// Description markers suggesting a novel technique.
    pub novelty_keywords: Vec<String>,
    /// Items with a CVSS score below this are filtered out.
    pub min_severity: f64,
    /// Require at least one technical writeup link.
    pub require_writeups: bool,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Transport-fault retry budget per draft.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// How many times a rejected draft may be restarted with adjusted
    /// constraints.
    pub max_redrafts: u32,
    pub max_post_chars: usize,
    pub max_thread_length: usize,
    /// Drafts containing any of these markers are rejected.
    pub disallowed_markers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub api_url: String,
    pub token: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub mode: RunMode,
    pub nvd_api_url: String,
    pub nvd_request_delay_secs: u64,
    pub generation_interval_secs: u64,
    pub posting: PostingConfig,
    pub collect: CollectConfig,
    pub dedup: DedupConfig,
    pub selector: SelectorConfig,
    pub generation: GenerationConfig,
    pub publish: PublishConfig,
}

impl Config {
    /// Load configuration from environment variables, with defaults suitable
    /// for a test-mode run against a local database.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env_or_default("DATABASE_URL", "sqlite://data/cve-poster.db"),
            mode: match env_or_default("RUN_MODE", "test").to_lowercase().as_str() {
                "live" => RunMode::Live,
                "test" => RunMode::Test,
                other => {
                    return Err(ConfigError::InvalidValue {
                        name: "RUN_MODE".to_string(),
                        message: format!("expected 'test' or 'live', got '{other}'"),
                    })
                }
            },
            nvd_api_url: env_or_default(
                "NVD_API_URL",
                "https://services.nvd.nist.gov/rest/json/cves/2.0",
            ),
            nvd_request_delay_secs: parse_env("NVD_REQUEST_DELAY_SECS", 6)?,
            generation_interval_secs: parse_env("GENERATION_INTERVAL_SECS", 3600)?,
            posting: PostingConfig {
                windows: parse_windows(&env_or_default("POSTING_WINDOWS", "09:00-11:00,17:00-20:00"))?,
                min_interval_minutes: parse_env("MIN_INTERVAL_MINUTES", 90)?,
                max_per_day: parse_env("MAX_POSTS_PER_DAY", 3)?,
                max_per_month: parse_env("MAX_POSTS_PER_MONTH", 60)?,
                timezone: parse_timezone(&env_or_default("TIMEZONE", "UTC"))?,
                count_test_posts: parse_env("COUNT_TEST_POSTS", false)?,
                quota_policy: if parse_env("QUOTA_FAIL_CLOSED", false)? {
                    QuotaPolicy::FailClosed
                } else {
                    QuotaPolicy::FailOpen
                },
            },
            collect: CollectConfig {
                window_hours: parse_env("COLLECT_WINDOW_HOURS", 48)?,
                cadence_secs: parse_env("COLLECT_CADENCE_SECS", 86_400)?,
                max_attempts: parse_env("COLLECT_MAX_ATTEMPTS", 3)?,
                retry_delay_secs: parse_env("COLLECT_RETRY_DELAY_SECS", 30)?,
                retention_days: parse_env("SOURCE_RETENTION_DAYS", 14)?,
            },
            dedup: DedupConfig {
                window_size: parse_env("DEDUP_WINDOW_SIZE", 50)?,
                overlap_threshold: parse_env("DEDUP_OVERLAP_THRESHOLD", 0.5)?,
            },
            selector: SelectorConfig {
                denylist: parse_list(&env_or_default(
                    "SELECTOR_DENYLIST",
                    "default password,default credential,missing authentication,\
                     cross-site scripting,sql injection,weak password,\
                     information disclosure,denial of service",
                )),
                novelty_keywords: parse_list(&env_or_default(
                    "SELECTOR_NOVELTY_KEYWORDS",
                    "novel,unique,sophisticated,chain,chained,complex,creative,unusual,unexpected",
                )),
                min_severity: parse_env("SELECTOR_MIN_SEVERITY", 7.0)?,
                require_writeups: parse_env("SELECTOR_REQUIRE_WRITEUPS", true)?,
            },
            generation: GenerationConfig {
                api_url: env_or_default("LLM_API_URL", "https://api.openai.com/v1/chat/completions"),
                api_key: env_or_default("LLM_API_KEY", ""),
                model: env_or_default("LLM_MODEL", "gpt-4o-mini"),
                max_tokens: parse_env("LLM_MAX_TOKENS", 1000)?,
                temperature: parse_env("LLM_TEMPERATURE", 0.7)?,
                timeout_secs: parse_env("LLM_TIMEOUT_SECS", 60)?,
                max_retries: parse_env("GENERATION_MAX_RETRIES", 3)?,
                retry_delay_secs: parse_env("GENERATION_RETRY_DELAY_SECS", 5)?,
                max_redrafts: parse_env("GENERATION_MAX_REDRAFTS", 2)?,
                max_post_chars: parse_env("MAX_POST_CHARS", 280)?,
                max_thread_length: parse_env("MAX_THREAD_LENGTH", 5)?,
                disallowed_markers: parse_list(&env_or_default(
                    "DISALLOWED_MARKERS",
                    "as an ai,i cannot,http://localhost",
                )),
            },
            publish: PublishConfig {
                api_url: env_or_default("PUBLISH_API_URL", "https://api.x.com/2/tweets"),
                token: env_or_default("PUBLISH_TOKEN", ""),
                timeout_secs: parse_env("PUBLISH_TIMEOUT_SECS", 30)?,
                max_retries: parse_env("PUBLISH_MAX_RETRIES", 3)?,
                retry_delay_secs: parse_env("PUBLISH_RETRY_DELAY_SECS", 5)?,
            },
        })
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name: name.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_timezone(value: &str) -> Result<Tz, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: "TIMEZONE".to_string(),
        message: format!("unknown timezone '{value}'"),
    })
}

/// Parse "HH:MM-HH:MM,HH:MM-HH:MM" into window pairs.
pub fn parse_windows(value: &str) -> Result<Vec<(NaiveTime, NaiveTime)>, ConfigError> {
    let mut windows = Vec::new();
    for spec in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (start, end) = spec.split_once('-').ok_or_else(|| ConfigError::InvalidValue {
            name: "POSTING_WINDOWS".to_string(),
            message: format!("expected HH:MM-HH:MM, got '{spec}'"),
        })?;
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| ConfigError::InvalidValue {
                name: "POSTING_WINDOWS".to_string(),
                message: format!("bad time '{s}': {e}"),
            })
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start >= end {
            return Err(ConfigError::InvalidValue {
                name: "POSTING_WINDOWS".to_string(),
                message: format!("window '{spec}' must start before it ends"),
            });
        }
        windows.push((start, end));
    }
    if windows.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: "POSTING_WINDOWS".to_string(),
            message: "at least one posting window is required".to_string(),
        });
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_list() {
        let windows = parse_windows("09:00-11:00, 17:30-20:00").unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].0, NaiveTime::from_hms_opt(17, 30, 0).unwrap());
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(parse_windows("20:00-09:00").is_err());
    }
}
