use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::GenerationConfig;
use crate::prompts;
use crate::types::{BotError, Draft, PostRecord, Result, SourceItem};

/// Terms used both for concept extraction and the technical-depth heuristic.
const TECHNICAL_TERMS: &[&str] = &[
    "buffer overflow",
    "race condition",
    "heap",
    "stack",
    "kernel",
    "syscall",
    "memory corruption",
    "exploit",
    "vulnerability",
    "payload",
    "shellcode",
    "rop chain",
    "sandbox escape",
    "privilege escalation",
    "use after free",
    "authentication bypass",
];

/// A text-generation backend. The trait implies no retry policy; the
/// generation pipeline owns that.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> String;

    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

/// OpenAI-compatible chat-completions backend.
pub struct OpenAiGenerator {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn name(&self) -> String {
        format!("openai ({})", self.model)
    }

    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": max_tokens,
                "temperature": temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotError::Transport(format!(
                "generation backend returned HTTP {status}"
            )));
        }

        let body: Value = response.json().await?;
        body.get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| BotError::Generation("empty completion response".to_string()))
    }
}

/// Scripted reply for the mock generator.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fault(String),
}

/// Mock generation backend for development and tests; replays a script of
/// canned replies and transport faults.
pub struct MockGenerator {
    name: String,
    replies: tokio::sync::Mutex<VecDeque<MockReply>>,
}

impl MockGenerator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_replies(name: &str, replies: Vec<MockReply>) -> Self {
        Self {
            name: name.to_string(),
            replies: tokio::sync::Mutex::new(replies.into()),
        }
    }

    pub async fn push_reply(&self, reply: MockReply) {
        self.replies.lock().await.push_back(reply);
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    fn name(&self) -> String {
        format!("mock ({})", self.name)
    }

    async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
        match self.replies.lock().await.pop_front() {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fault(message)) => Err(BotError::Transport(message)),
            None => Err(BotError::Transport("mock reply script exhausted".to_string())),
        }
    }
}

/// Result of one generation attempt for a candidate item.
#[derive(Debug)]
pub enum DraftOutcome {
    Approved(Draft),
    /// Both retry budgets were exhausted or the backend stayed down; the
    /// cycle reports failure and the process continues.
    Abandoned { reason: String },
}

/// Drives a draft through Drafting -> Validating -> Approved | Rejected.
/// Transport faults retry the same draft request with backoff inside a
/// bounded budget; validation rejections restart drafting with adjusted
/// constraints inside a separate bounded redraft budget.
pub struct GenerationPipeline {
    generator: Arc<dyn TextGenerator>,
    config: GenerationConfig,
}

impl GenerationPipeline {
    pub fn new(generator: Arc<dyn TextGenerator>, config: GenerationConfig) -> Self {
        Self { generator, config }
    }

    pub async fn produce(
        &self,
        item: &SourceItem,
        history: &[PostRecord],
        known_ids: &HashSet<String>,
    ) -> Result<DraftOutcome> {
        let base_prompt = format!(
            "{}\n\n{}",
            prompts::system_prompt(),
            prompts::thread_prompt(item, history, self.config.max_post_chars)
        );
        let mut constraint_note = String::new();

        for redraft in 0..=self.config.max_redrafts {
            let prompt = format!("{base_prompt}{constraint_note}");
            let text = match self.draft_with_retries(&prompt).await {
                Ok(text) => text,
                Err(e) if e.is_transport() => {
                    return Ok(DraftOutcome::Abandoned {
                        reason: format!("generation retry budget exhausted: {e}"),
                    });
                }
                Err(e) => return Err(e),
            };

            match self.validate(&text, item, known_ids) {
                Ok(draft) => {
                    info!(
                        cve = %item.id,
                        parts = draft.parts.len(),
                        depth = draft.technical_depth,
                        "Draft approved"
                    );
                    return Ok(DraftOutcome::Approved(draft));
                }
                Err(reason) => {
                    warn!(cve = %item.id, redraft, "Draft rejected: {reason}");
                    constraint_note = prompts::redraft_note(&reason);
                }
            }
        }

        Ok(DraftOutcome::Abandoned {
            reason: format!(
                "redraft budget exhausted after {} attempt(s)",
                self.config.max_redrafts + 1
            ),
        })
    }

    /// Transport faults count toward a bounded retry budget with backoff;
    /// any other error aborts immediately.
    async fn draft_with_retries(&self, prompt: &str) -> Result<String> {
        let mut backoff = ExponentialBackoff {
            initial_interval: StdDuration::from_secs(self.config.retry_delay_secs),
            current_interval: StdDuration::from_secs(self.config.retry_delay_secs),
            max_interval: StdDuration::from_secs(self.config.retry_delay_secs * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = BotError::Transport("no generation attempt made".to_string());
        for attempt in 1..=self.config.max_retries {
            match self
                .generator
                .generate(prompt, self.config.max_tokens, self.config.temperature)
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transport() => {
                    warn!(
                        backend = %self.generator.name(),
                        attempt,
                        "Generation transport fault: {e}"
                    );
                    last_error = e;
                    if attempt < self.config.max_retries {
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

    /// Structural and safety checks. Any violation yields a specific reason
    /// used to adjust the next redraft.
    fn validate(
        &self,
        text: &str,
        item: &SourceItem,
        known_ids: &HashSet<String>,
    ) -> std::result::Result<Draft, String> {
        let parts = parse_thread(text)?;

        if parts.len() > self.config.max_thread_length {
            return Err(format!(
                "thread has {} parts, limit is {}",
                parts.len(),
                self.config.max_thread_length
            ));
        }

        for (i, part) in parts.iter().enumerate() {
            let chars = part.chars().count();
            if chars > self.config.max_post_chars {
                return Err(format!(
                    "part {} is {} characters, limit is {}",
                    i + 1,
                    chars,
                    self.config.max_post_chars
                ));
            }
            let lower = part.to_lowercase();
            if let Some(marker) = self
                .config
                .disallowed_markers
                .iter()
                .find(|m| lower.contains(*m))
            {
                return Err(format!("part {} contains disallowed marker '{marker}'", i + 1));
            }
        }

        // Safety: a draft may only reference vulnerability records we have
        // actually fetched.
        let joined = parts.join("\n");
        let mentioned = extract_cve_ids(&joined);
        for cve_id in &mentioned {
            if cve_id != &item.id && !known_ids.contains(cve_id) {
                return Err(format!("references unknown identifier {cve_id}"));
            }
        }

        let mut concepts: Vec<String> = item.interesting_factors.clone();
        for concept in extract_concepts(&joined) {
            if !concepts.contains(&concept) {
                concepts.push(concept);
            }
        }

        let mut cve_ids = vec![item.id.clone()];
        for cve_id in mentioned {
            if !cve_ids.contains(&cve_id) {
                cve_ids.push(cve_id);
            }
        }

        let technical_depth = estimate_depth(&joined);
        debug!(cve = %item.id, depth = technical_depth, "Draft passed validation");

        Ok(Draft {
            parts,
            concepts,
            cve_ids,
            technical_depth,
        })
    }
}

/// Split generated text into thread parts. Lines in "N/ content" form make
/// a thread and must number contiguously from 1; text without markers is a
/// single post.
pub fn parse_thread(text: &str) -> std::result::Result<Vec<String>, String> {
    let mut numbered: Vec<(u32, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some((prefix, rest)) = line.split_once('/') {
            if let Ok(n) = prefix.trim().parse::<u32>() {
                let content = rest.trim();
                if !content.is_empty() {
                    numbered.push((n, content.to_string()));
                    continue;
                }
            }
        }
    }

    if numbered.is_empty() {
        let single = text.trim();
        if single.is_empty() {
            return Err("empty draft".to_string());
        }
        return Ok(vec![single.to_string()]);
    }

    for (i, (n, _)) in numbered.iter().enumerate() {
        if *n != (i + 1) as u32 {
            return Err(format!(
                "thread numbering is not contiguous: expected {}, found {n}",
                i + 1
            ));
        }
    }

    Ok(numbered.into_iter().map(|(_, content)| content).collect())
}

/// Identifiers in CVE-YYYY-NNNNN form appearing in the text.
pub fn extract_cve_ids(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',') {
        let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-');
        let upper = token.to_uppercase();
        if upper.starts_with("CVE-") && upper.len() > 8 && !ids.contains(&upper) {
            ids.push(upper);
        }
    }
    ids
}

/// Technical terms present in the content, in first-appearance order.
pub fn extract_concepts(content: &str) -> Vec<String> {
    let lower = content.to_lowercase();
    TECHNICAL_TERMS
        .iter()
        .filter(|term| lower.contains(**term))
        .map(|term| term.to_string())
        .collect()
}

/// Term-density heuristic for technical depth on a 1-5 scale, used when the
/// generator supplies no explicit rating.
pub fn estimate_depth(content: &str) -> i32 {
    let lower = content.to_lowercase();
    let hits = TECHNICAL_TERMS
        .iter()
        .filter(|term| lower.contains(**term))
        .count() as i32;
    (1 + hits / 2).clamp(1, 5)
}
