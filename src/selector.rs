use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::config::SelectorConfig;
use crate::types::{PostRecord, SourceItem};

/// How often each concept appeared in recent history. Categories that are
/// under-represented push matching candidates up the ranking.
#[derive(Debug, Default)]
pub struct ContentMix {
    counts: HashMap<String, usize>,
}

impl ContentMix {
    pub fn from_posts(posts: &[PostRecord]) -> Self {
        let mut counts = HashMap::new();
        for post in posts {
            for concept in &post.concepts {
                *counts.entry(concept.to_lowercase()).or_insert(0) += 1;
            }
        }
        Self { counts }
    }

    fn frequency(&self, concept: &str) -> usize {
        self.counts.get(&concept.to_lowercase()).copied().unwrap_or(0)
    }
}

/// Why an item was ranked where it was; carried alongside the item for
/// logging and operator inspection.
#[derive(Debug, Clone)]
pub struct SelectionRationale {
    pub score: f64,
    pub novelty: f64,
    pub severity: f64,
    pub mix_bonus: f64,
    pub reasons: Vec<String>,
}

/// Filters out boring items, then ranks the rest by a weighted blend of
/// novelty, severity and distance from current content-mix targets. Fully
/// deterministic: ties break on newer disclosure, then lexicographic id.
pub struct CandidateSelector {
    config: SelectorConfig,
}

impl CandidateSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn select(
        &self,
        items: Vec<SourceItem>,
        mix: &ContentMix,
    ) -> Vec<(SourceItem, SelectionRationale)> {
        let mut ranked: Vec<(SourceItem, SelectionRationale)> = items
            .into_iter()
            .filter(|item| self.passes_filter(item))
            .map(|item| {
                let rationale = self.score(&item, mix);
                (item, rationale)
            })
            .collect();

        ranked.sort_by(|(a, ra), (b, rb)| {
            rb.score
                .partial_cmp(&ra.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.published_at.cmp(&a.published_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        debug!("Selector ranked {} candidate(s)", ranked.len());
        ranked
    }

    fn passes_filter(&self, item: &SourceItem) -> bool {
        let desc = item.description.to_lowercase();
        if self.config.denylist.iter().any(|p| desc.contains(p)) {
            return false;
        }
        if self.config.require_writeups && item.writeups.is_empty() {
            return false;
        }
        if item.interesting_factors.is_empty() {
            return false;
        }
        if let Some(severity) = item.severity {
            if severity < self.config.min_severity {
                return false;
            }
        }
        true
    }

    fn score(&self, item: &SourceItem, mix: &ContentMix) -> SelectionRationale {
        let mut reasons = Vec::new();
        let desc = item.description.to_lowercase();

        let novelty_hits = self
            .config
            .novelty_keywords
            .iter()
            .filter(|k| desc.contains(*k))
            .count();
        let factor_count = item.interesting_factors.len();
        let novelty = ((factor_count as f64) * 0.25 + (novelty_hits as f64) * 0.25).min(1.0);
        if novelty_hits > 0 {
            reasons.push(format!("{novelty_hits} novelty keyword(s)"));
        }
        if factor_count > 0 {
            reasons.push(format!(
                "interesting factors: {}",
                item.interesting_factors.join(", ")
            ));
        }

        let severity = item.severity.map_or(0.5, |s| (s / 10.0).clamp(0.0, 1.0));
        if let Some(s) = item.severity {
            reasons.push(format!("cvss {s:.1}"));
        }

        // Under-represented categories score higher; a factor never covered
        // recently contributes a full point.
        let mix_bonus = if factor_count == 0 {
            0.0
        } else {
            let sum: f64 = item
                .interesting_factors
                .iter()
                .map(|f| 1.0 / (1.0 + mix.frequency(f) as f64))
                .sum();
            sum / factor_count as f64
        };
        if mix_bonus > 0.5 {
            reasons.push("under-represented topic".to_string());
        }

        let score = 0.4 * novelty + 0.4 * severity + 0.2 * mix_bonus;
        SelectionRationale {
            score,
            novelty,
            severity,
            mix_bonus,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn config() -> SelectorConfig {
        SelectorConfig {
            denylist: vec!["sql injection".to_string(), "denial of service".to_string()],
            novelty_keywords: vec!["novel".to_string(), "chained".to_string()],
            min_severity: 7.0,
            require_writeups: true,
        }
    }

    fn item(id: &str, desc: &str, severity: Option<f64>, day: u32) -> SourceItem {
        SourceItem {
            id: id.to_string(),
            published_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            description: desc.to_string(),
            severity,
            references: vec!["https://blog.example.com/x".to_string()],
            writeups: vec!["https://blog.example.com/x".to_string()],
            interesting_factors: vec!["race condition".to_string()],
        }
    }

    #[test]
    fn denylisted_items_are_dropped() {
        let selector = CandidateSelector::new(config());
        let items = vec![item(
            "CVE-2024-0001",
            "A SQL injection in the admin panel",
            Some(9.8),
            1,
        )];
        assert!(selector.select(items, &ContentMix::default()).is_empty());
    }

    #[test]
    fn low_severity_items_are_dropped() {
        let selector = CandidateSelector::new(config());
        let items = vec![item("CVE-2024-0002", "A race condition", Some(4.0), 1)];
        assert!(selector.select(items, &ContentMix::default()).is_empty());
    }

    #[test]
    fn ties_break_on_recency_then_id() {
        let selector = CandidateSelector::new(config());
        let items = vec![
            item("CVE-2024-0200", "A race condition", Some(8.0), 1),
            item("CVE-2024-0100", "A race condition", Some(8.0), 2),
            item("CVE-2024-0050", "A race condition", Some(8.0), 2),
        ];
        let ranked = selector.select(items, &ContentMix::default());
        let ids: Vec<&str> = ranked.iter().map(|(i, _)| i.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-2024-0050", "CVE-2024-0100", "CVE-2024-0200"]);
    }

    #[test]
    fn under_represented_topics_rank_higher() {
        let selector = CandidateSelector::new(config());
        let mut stale = item("CVE-2024-0300", "A race condition", Some(8.0), 1);
        stale.interesting_factors = vec!["race condition".to_string()];
        let mut fresh = item("CVE-2024-0301", "A sandbox escape", Some(8.0), 1);
        fresh.interesting_factors = vec!["sandbox escape".to_string()];

        let history = vec![PostRecord {
            id: uuid::Uuid::new_v4(),
            created_at: Utc::now(),
            content: String::new(),
            concepts: vec!["race condition".to_string()],
            cve_ids: vec![],
            technical_depth: 3,
            thread_id: None,
            thread_position: None,
            external_id: None,
        }];
        let mix = ContentMix::from_posts(&history);

        let ranked = selector.select(vec![stale, fresh], &mix);
        assert_eq!(ranked[0].0.id, "CVE-2024-0301");
    }
}
