//! Context Assembler
//!
//! Builds the evaluation and fix bundles for one item and writes them to the
//! state store. Callers only ever get a [`BundleRef`] back.

use regex::Regex;
use serde::Serialize;
use sift_adapters::git_ops;
use sift_adapters::store::StateStore;
use sift_core::duplicates::{DuplicateCandidate, DuplicateDetector, IndexEntry};
use sift_core::util::truncate;
use sift_core::{
    BundleKind, BundleRef, Comment, Item, ItemStatus, Location, Outcome, ProjectConfig,
    Recommendation, ThreadKind, TriageResult, ValidationError,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const MAX_EXCERPT_LINE_CHARS: usize = 240;
/// Upper bound on excerpt height for very wide line ranges.
const MAX_EXCERPT_LINES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceExcerpt {
    pub path: String,
    pub first_line: usize,
    pub last_line: usize,
    /// Numbered lines, `"  10| code"`.
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommentContext {
    pub id: String,
    pub author: String,
    pub thread_kind: ThreadKind,
    pub body: String,
}

impl From<&Comment> for CommentContext {
    fn from(comment: &Comment) -> Self {
        Self {
            id: comment.id.clone(),
            author: comment.author.clone(),
            thread_kind: comment.thread_kind,
            body: comment.body.clone(),
        }
    }
}

/// One resolved item in the compact decision index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexLine {
    pub item_id: String,
    pub outcome: Outcome,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationBundle {
    pub item_id: String,
    pub summary: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub comment: CommentContext,
    /// Prior decisions grouped by category.
    pub decision_index: BTreeMap<String, Vec<IndexLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_candidate: Option<DuplicateCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceExcerpt>,
    pub result_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixBundle {
    pub item_id: String,
    pub summary: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub comment: CommentContext,
    pub recommendation: Recommendation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceExcerpt>,
    pub project: ProjectConfig,
    pub result_path: PathBuf,
}

pub struct ContextAssembler {
    store: StateStore,
    detector: DuplicateDetector,
    radius: usize,
}

impl ContextAssembler {
    pub fn new(store: StateStore, detector: DuplicateDetector, radius: usize) -> Self {
        Self {
            store,
            detector,
            radius,
        }
    }

    /// Write the evaluation bundle for `item_id`, replacing any earlier one.
    pub fn evaluation_bundle(&self, item_id: &str) -> TriageResult<BundleRef> {
        let (item, comment) = self.open_item(item_id)?;
        let index = self.decision_index(&item.id)?;
        let duplicate_candidate =
            self.detector
                .find_candidate(&item.id, &item.category, &item.summary, &index);
        if let Some(candidate) = &duplicate_candidate {
            tracing::debug!(
                item = %item.id,
                candidate = %candidate.item_id,
                score = candidate.score,
                "duplicate candidate surfaced"
            );
        }

        let bundle = EvaluationBundle {
            source: self.excerpt(item.location.as_ref()),
            decision_index: group_by_category(&index),
            duplicate_candidate,
            comment: CommentContext::from(&comment),
            result_path: self.store.result_path(&item.id, BundleKind::Evaluate),
            item_id: item.id,
            summary: item.summary,
            category: item.category,
            location: item.location,
        };
        Ok(self
            .store
            .write_bundle(&bundle.item_id, BundleKind::Evaluate, &bundle)?)
    }

    /// Write the fix bundle: the recommendation plus what the fixer needs to
    /// build and verify. The duplicate index is left out.
    pub fn fix_bundle(
        &self,
        item_id: &str,
        recommendation: &Recommendation,
    ) -> TriageResult<BundleRef> {
        let (item, comment) = self.open_item(item_id)?;
        let bundle = FixBundle {
            source: self.excerpt(item.location.as_ref()),
            comment: CommentContext::from(&comment),
            recommendation: recommendation.clone(),
            project: self.store.load_project_config()?,
            result_path: self.store.result_path(&item.id, BundleKind::Fix),
            item_id: item.id,
            summary: item.summary,
            category: item.category,
            location: item.location,
        };
        Ok(self
            .store
            .write_bundle(&bundle.item_id, BundleKind::Fix, &bundle)?)
    }

    /// Every decided item except `exclude`, in decision order.
    pub fn decision_index(&self, exclude: &str) -> TriageResult<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for decision in self.store.load_decisions()? {
            if decision.item_id == exclude {
                continue;
            }
            let Some(item) = self.store.load_item(&decision.item_id)? else {
                tracing::warn!(item = %decision.item_id, "decision without item; left out of index");
                continue;
            };
            entries.push(IndexEntry {
                item_id: item.id,
                category: item.category,
                summary: item.summary,
                outcome: decision.outcome,
                duplicate_of: decision.duplicate_of,
                decided_at: decision.decided_at,
            });
        }
        Ok(entries)
    }

    fn open_item(&self, item_id: &str) -> TriageResult<(Item, Comment)> {
        let item = self
            .store
            .load_item(item_id)?
            .ok_or_else(|| ValidationError::UnknownItem {
                item_id: item_id.to_string(),
            })?;
        if item.status == ItemStatus::Resolved {
            return Err(ValidationError::AlreadyResolved { item_id: item.id }.into());
        }
        let comment = self.store.load_comment(&item.parent_comment_id)?;
        Ok((item, comment))
    }

    fn excerpt(&self, location: Option<&Location>) -> Option<SourceExcerpt> {
        let location = location?;
        let lines = match git_ops::read_file_lines(self.store.repo_root(), &location.path) {
            Ok(Some(lines)) => lines,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(path = %location.path, error = %err, "could not read source for bundle");
                return None;
            }
        };
        source_excerpt(&location.path, &lines, location, self.radius)
    }
}

/// Lines around `location`, clamped to the file. A location without line
/// numbers shows the top of the file.
fn source_excerpt(
    path: &str,
    lines: &[String],
    location: &Location,
    radius: usize,
) -> Option<SourceExcerpt> {
    if lines.is_empty() {
        return None;
    }
    let len = lines.len();
    let start = location.start_line.or(location.end_line).unwrap_or(1);
    let end = location.anchor_line().unwrap_or(1);
    let start = start.clamp(1, len);
    let end = end.clamp(start, len);

    let first = start.saturating_sub(radius).max(1);
    let last = (end + radius).min(len).min(first + MAX_EXCERPT_LINES - 1);

    let text = lines
        .iter()
        .enumerate()
        .skip(first - 1)
        .take(last - first + 1)
        .map(|(i, line)| format!("{:4}| {}", i + 1, truncate(line, MAX_EXCERPT_LINE_CHARS)))
        .collect::<Vec<_>>()
        .join("\n");

    Some(SourceExcerpt {
        path: path.to_string(),
        first_line: first,
        last_line: last,
        text: redact_obvious_secrets(&text),
    })
}

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)\b(api[_-]?key|token|secret|password)\b\s*[:=]\s*["'][^"']{8,}["']"#,
            r#"(?i)\b(bearer)\s+[A-Za-z0-9._-]{16,}"#,
            r#"\b(gh[pousr]_[A-Za-z0-9]{16,})\b"#,
            r#"\b(AKIA[0-9A-Z]{16})\b"#,
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Bundles leave the process, so obvious credentials are masked first.
fn redact_obvious_secrets(snippet: &str) -> String {
    secret_patterns()
        .iter()
        .fold(snippet.to_string(), |out, re| {
            re.replace_all(&out, "<redacted-secret>").into_owned()
        })
}

fn group_by_category(index: &[IndexEntry]) -> BTreeMap<String, Vec<IndexLine>> {
    let mut grouped: BTreeMap<String, Vec<IndexLine>> = BTreeMap::new();
    for entry in index {
        grouped
            .entry(entry.category.clone())
            .or_default()
            .push(IndexLine {
                item_id: entry.item_id.clone(),
                outcome: entry.outcome,
                summary: entry.summary.clone(),
                duplicate_of: entry.duplicate_of.clone(),
            });
    }
    grouped
}

/// Read a bundle back, for inspection and tests.
pub fn read_bundle(path: &Path) -> Result<serde_json::Value, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read bundle '{}': {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| format!("Failed to parse bundle '{}': {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{comment_at, seeded_store};
    use sift_core::{Confidence, Decision};

    fn numbered(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("line {}", i)).collect()
    }

    #[test]
    fn excerpt_is_clamped_to_file() {
        let lines = numbered(5);
        let loc = Location::new("a.py", Some(2), None);
        let excerpt = source_excerpt("a.py", &lines, &loc, 8).unwrap();
        assert_eq!((excerpt.first_line, excerpt.last_line), (1, 5));

        let past_end = Location::new("a.py", Some(40), None);
        let excerpt = source_excerpt("a.py", &lines, &past_end, 1).unwrap();
        assert_eq!((excerpt.first_line, excerpt.last_line), (4, 5));
        assert!(excerpt.text.ends_with("   5| line 5"));
    }

    #[test]
    fn excerpt_covers_ranges_plus_radius() {
        let lines = numbered(100);
        let loc = Location::new("a.py", Some(20), Some(30));
        let excerpt = source_excerpt("a.py", &lines, &loc, 2).unwrap();
        assert_eq!((excerpt.first_line, excerpt.last_line), (18, 32));
        assert!(source_excerpt("a.py", &[], &loc, 2).is_none());
    }

    #[test]
    fn excerpt_caps_long_lines_and_redacts() {
        let lines = vec![
            "x".repeat(1000),
            r#"let token = "abcdefghijklmnop";"#.to_string(),
        ];
        let loc = Location::new("a.rs", Some(1), None);
        let excerpt = source_excerpt("a.rs", &lines, &loc, 3).unwrap();
        let first = excerpt.text.lines().next().unwrap();
        assert!(first.chars().count() < 260);
        assert!(first.ends_with("..."));
        assert!(excerpt.text.contains("<redacted-secret>"));
        assert!(!excerpt.text.contains("abcdefghijklmnop"));
    }

    #[test]
    fn evaluation_bundle_carries_source_and_candidate() {
        let (dir, store) = seeded_store(vec![
            comment_at("100", "missing null check on the user lookup", "src/a.rs", 3, 0),
            comment_at("200", "missing null check in the user lookup", "src/a.rs", 4, 1),
        ]);
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "fn a() {}\nfn b() {}\nlet u = find();\nuse(u);\n").unwrap();

        let mut first = store.load_item("100.1").unwrap().unwrap();
        first.status = ItemStatus::Resolved;
        store.save_item(&first).unwrap();
        store
            .insert_decision(&Decision {
                item_id: "100.1".to_string(),
                outcome: Outcome::Fixed,
                reasoning: "added guard".to_string(),
                commit_ref: Some("abc123".to_string()),
                duplicate_of: None,
                linked_issue: None,
                decided_at: chrono::Utc::now(),
                revision: 1,
            })
            .unwrap();

        let assembler = ContextAssembler::new(store.clone(), DuplicateDetector::default(), 1);
        let bundle = assembler.evaluation_bundle("200.1").unwrap();
        assert_eq!(bundle.path, store.bundle_path("200.1", BundleKind::Evaluate));

        let json = read_bundle(&bundle.path).unwrap();
        assert_eq!(json["duplicate_candidate"]["item_id"], "100.1");
        assert_eq!(json["decision_index"]["null-safety"][0]["item_id"], "100.1");
        assert_eq!(json["comment"]["author"], "reviewer");
        assert_eq!(json["source"]["first_line"], 3);
        assert!(json["source"]["text"].as_str().unwrap().contains("let u = find();"));

        // Regenerating replaces the bundle without touching item state.
        let again = assembler.evaluation_bundle("200.1").unwrap();
        assert_eq!(again, bundle);
        assert_eq!(
            store.load_item("200.1").unwrap().unwrap().status,
            ItemStatus::Pending
        );
    }

    #[test]
    fn fix_bundle_includes_recommendation_and_project() {
        let (_dir, store) = seeded_store(vec![comment_at("7", "rename tmp to buffer", "src/b.rs", 1, 0)]);
        let assembler = ContextAssembler::new(store.clone(), DuplicateDetector::default(), 4);
        let recommendation = Recommendation {
            summary: "rename tmp".to_string(),
            already_fixed: false,
            duplicate_candidate: None,
            recommended_outcome: Outcome::Fixed,
            confidence: Confidence::High,
            reasoning: "clearer name".to_string(),
        };
        let bundle = assembler.fix_bundle("7.1", &recommendation).unwrap();
        let json = read_bundle(&bundle.path).unwrap();
        assert_eq!(json["recommendation"]["summary"], "rename tmp");
        assert!(json.get("decision_index").is_none());
        assert!(json.get("source").is_none());
        assert!(json["result_path"].as_str().unwrap().ends_with("fix.json"));
    }

    #[test]
    fn bundles_refuse_unknown_and_resolved_items() {
        let (_dir, store) = seeded_store(vec![comment_at("7", "rename tmp", "src/b.rs", 1, 0)]);
        let assembler = ContextAssembler::new(store.clone(), DuplicateDetector::default(), 4);
        assert!(assembler.evaluation_bundle("nope.1").is_err());

        let mut item = store.load_item("7.1").unwrap().unwrap();
        item.status = ItemStatus::Resolved;
        store.save_item(&item).unwrap();
        let err = assembler.evaluation_bundle("7.1").unwrap_err();
        assert!(err.to_string().contains("already resolved"));
    }
}
