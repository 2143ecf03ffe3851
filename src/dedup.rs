use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::types::{DedupVerdict, PostRecord};

/// Read-only view over the last K posts' concept tags, per-concept maximum
/// depth and referenced CVE ids. Rebuilt from the history store before each
/// generation cycle; never mutated.
#[derive(Debug, Default)]
pub struct ConceptHistoryWindow {
    concepts: HashSet<String>,
    max_depth: HashMap<String, i32>,
    used_cves: HashSet<String>,
}

impl ConceptHistoryWindow {
    pub fn from_posts(posts: &[PostRecord]) -> Self {
        let mut window = Self::default();
        for post in posts {
            for concept in &post.concepts {
                let concept = concept.to_lowercase();
                let depth = window.max_depth.entry(concept.clone()).or_insert(0);
                *depth = (*depth).max(post.technical_depth);
                window.concepts.insert(concept);
            }
            for cve_id in &post.cve_ids {
                window.used_cves.insert(cve_id.clone());
            }
        }
        window
    }

    pub fn covers_cve(&self, cve_id: &str) -> bool {
        self.used_cves.contains(cve_id)
    }

    pub fn covers_concept(&self, concept: &str) -> bool {
        self.concepts.contains(&concept.to_lowercase())
    }
}

/// Pure overlap check against recent history. Repetition above the overlap
/// threshold is allowed only when the candidate goes strictly deeper than
/// all prior coverage of the overlapping concepts. Depth is the only proxy
/// for "meaningfully deeper" here; it cannot detect topical deepening that
/// leaves the numeric score unchanged.
#[derive(Debug, Clone)]
pub struct DedupChecker {
    overlap_threshold: f64,
}

impl DedupChecker {
    pub fn new(overlap_threshold: f64) -> Self {
        Self { overlap_threshold }
    }

    pub fn is_allowed(
        &self,
        window: &ConceptHistoryWindow,
        candidate_concepts: &[String],
        candidate_depth: i32,
    ) -> DedupVerdict {
        if candidate_concepts.is_empty() {
            return DedupVerdict::Allowed;
        }

        let candidate: HashSet<String> = candidate_concepts
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        let overlapping: Vec<&String> = candidate
            .iter()
            .filter(|c| window.concepts.contains(*c))
            .collect();
        let overlap = overlapping.len() as f64 / candidate.len() as f64;

        if overlap <= self.overlap_threshold {
            return DedupVerdict::Allowed;
        }

        let prior_max = overlapping
            .iter()
            .filter_map(|c| window.max_depth.get(*c))
            .copied()
            .max()
            .unwrap_or(0);

        if candidate_depth > prior_max {
            debug!(
                overlap,
                candidate_depth, prior_max, "Overlapping candidate allowed: goes strictly deeper"
            );
            DedupVerdict::Allowed
        } else {
            DedupVerdict::Rejected { overlap }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn post(concepts: &[&str], depth: i32, cve: Option<&str>) -> PostRecord {
        PostRecord {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            content: String::new(),
            concepts: concepts.iter().map(|s| s.to_string()).collect(),
            cve_ids: cve.into_iter().map(|s| s.to_string()).collect(),
            technical_depth: depth,
            thread_id: None,
            thread_position: None,
            external_id: None,
        }
    }

    #[test]
    fn shallow_repeat_is_rejected() {
        let window = ConceptHistoryWindow::from_posts(&[post(&["buffer overflow"], 4, None)]);
        let checker = DedupChecker::new(0.5);
        let verdict = checker.is_allowed(&window, &["buffer overflow".to_string()], 2);
        assert!(matches!(verdict, DedupVerdict::Rejected { overlap } if overlap == 1.0));
    }

    #[test]
    fn deeper_repeat_is_allowed() {
        let window = ConceptHistoryWindow::from_posts(&[post(&["buffer overflow"], 4, None)]);
        let checker = DedupChecker::new(0.5);
        let verdict = checker.is_allowed(&window, &["buffer overflow".to_string()], 5);
        assert_eq!(verdict, DedupVerdict::Allowed);
    }

    #[test]
    fn low_overlap_passes_regardless_of_depth() {
        let window = ConceptHistoryWindow::from_posts(&[post(&["heap spray"], 5, None)]);
        let checker = DedupChecker::new(0.5);
        let concepts = vec![
            "heap spray".to_string(),
            "rop chain".to_string(),
            "sandbox escape".to_string(),
        ];
        assert_eq!(checker.is_allowed(&window, &concepts, 1), DedupVerdict::Allowed);
    }

    #[test]
    fn empty_candidate_is_allowed() {
        let window = ConceptHistoryWindow::from_posts(&[post(&["kernel"], 3, None)]);
        let checker = DedupChecker::new(0.5);
        assert_eq!(checker.is_allowed(&window, &[], 1), DedupVerdict::Allowed);
    }

    #[test]
    fn tracks_referenced_cves() {
        let window =
            ConceptHistoryWindow::from_posts(&[post(&["kernel"], 3, Some("CVE-2024-0001"))]);
        assert!(window.covers_cve("CVE-2024-0001"));
        assert!(!window.covers_cve("CVE-2024-0002"));
    }
}
