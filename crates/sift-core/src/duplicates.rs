//! Advisory duplicate detection over the decision index.
//!
//! The matching method is pluggable through [`SimilarityStrategy`]; the
//! default [`LexicalOverlap`] compares normalised token sets. Nothing here
//! ever records a DUPLICATE outcome. It only surfaces a candidate.

use crate::model::Outcome;
use crate::protocol::Confidence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default minimum score for a candidate to be surfaced at all.
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.5;
/// Scores at or above this are reported with high confidence.
const HIGH_CONFIDENCE_SCORE: f64 = 0.8;

/// One resolved item as seen by the duplicate index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub item_id: String,
    pub category: String,
    pub summary: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    /// Root item (never itself a DUPLICATE).
    pub item_id: String,
    pub summary: String,
    pub outcome: Outcome,
    pub score: f64,
    pub confidence: Confidence,
}

/// Scores how alike two item summaries are, in `0.0..=1.0`.
pub trait SimilarityStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaccard overlap of normalised, stop-word-filtered tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalOverlap;

impl SimilarityStrategy for LexicalOverlap {
    fn name(&self) -> &'static str {
        "lexical-overlap"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let left = collect_similarity_tokens(a);
        let right = collect_similarity_tokens(b);
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }
        let shared = left.intersection(&right).count();
        let union = left.union(&right).count();
        shared as f64 / union as f64
    }
}

pub struct DuplicateDetector {
    strategy: Box<dyn SimilarityStrategy>,
    threshold: f64,
}

impl std::fmt::Debug for DuplicateDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateDetector")
            .field("strategy", &self.strategy.name())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_THRESHOLD)
    }
}

impl DuplicateDetector {
    pub fn new(threshold: f64) -> Self {
        Self::with_strategy(Box::new(LexicalOverlap), threshold)
    }

    pub fn with_strategy(strategy: Box<dyn SimilarityStrategy>, threshold: f64) -> Self {
        Self {
            strategy,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Find at most one prior item in the same category that looks like the
    /// same request. Among entries clearing the threshold the most recently
    /// decided one wins, whatever its confidence; equal times fall back to
    /// the higher score.
    pub fn find_candidate(
        &self,
        item_id: &str,
        category: &str,
        summary: &str,
        index: &[IndexEntry],
    ) -> Option<DuplicateCandidate> {
        let mut best: Option<(DuplicateCandidate, DateTime<Utc>)> = None;

        for entry in index {
            if entry.item_id == item_id || entry.category != category {
                continue;
            }
            let score = self.strategy.similarity(summary, &entry.summary);
            let Some(confidence) = self.confidence_for(score) else {
                continue;
            };
            let Some(root) = resolve_root(entry, index) else {
                continue;
            };
            if root.item_id == item_id {
                continue;
            }

            let candidate = DuplicateCandidate {
                item_id: root.item_id.clone(),
                summary: root.summary.clone(),
                outcome: root.outcome,
                score,
                confidence,
            };
            let replace = match &best {
                None => true,
                Some((current, decided_at)) => {
                    (entry.decided_at, candidate.score) > (*decided_at, current.score)
                }
            };
            if replace {
                best = Some((candidate, entry.decided_at));
            }
        }

        best.map(|(candidate, _)| candidate)
    }

    fn confidence_for(&self, score: f64) -> Option<Confidence> {
        if score <= 0.0 || score < self.threshold {
            None
        } else if score >= self.threshold.max(HIGH_CONFIDENCE_SCORE) {
            Some(Confidence::High)
        } else {
            Some(Confidence::Medium)
        }
    }
}

/// Follow a DUPLICATE entry to the decision it points at. Returns `None` if
/// the target is missing or is itself a duplicate.
fn resolve_root<'a>(entry: &'a IndexEntry, index: &'a [IndexEntry]) -> Option<&'a IndexEntry> {
    if entry.outcome != Outcome::Duplicate {
        return Some(entry);
    }
    let target = entry.duplicate_of.as_deref()?;
    index
        .iter()
        .find(|candidate| candidate.item_id == target)
        .filter(|root| root.outcome != Outcome::Duplicate)
}

fn normalize_similarity_token(raw: &str) -> Option<String> {
    let mut token = raw.trim().to_ascii_lowercase();
    if token.len() < 3 || token.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }

    let stop_words = [
        "the", "and", "for", "with", "from", "that", "this", "these", "those", "are", "was",
        "were", "will", "can", "could", "should", "would", "into", "after", "before", "about",
        "when", "where", "which", "there", "their", "them", "then", "than", "because", "using",
        "just", "only", "each", "more", "most", "some", "very", "also", "does", "did", "has",
        "have", "had", "its", "our", "your", "you", "please", "here", "maybe", "might", "consider",
        "nit", "think",
    ];
    if stop_words.contains(&token.as_str()) {
        return None;
    }

    for suffix in ["ing", "ed", "es", "s"] {
        if token.len() > 5 && token.ends_with(suffix) {
            token.truncate(token.len() - suffix.len());
            break;
        }
    }

    if token.len() < 3 {
        return None;
    }

    Some(token)
}

fn collect_similarity_tokens(text: &str) -> HashSet<String> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .filter_map(normalize_similarity_token)
        .collect()
}
