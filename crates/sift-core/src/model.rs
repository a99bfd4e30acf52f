//! Persisted entities for a triage run.
//!
//! Everything here is plain data. The State Store owns the on-disk copies;
//! the engine only ever holds transient snapshots.

use crate::util::{collapse_whitespace, pad_to_width, truncate_to_width};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// File path plus optional 1-based line range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
}

impl Location {
    pub fn new(path: impl Into<String>, start_line: Option<usize>, end_line: Option<usize>) -> Self {
        let end_line = match (start_line, end_line) {
            (Some(start), Some(end)) if end < start => Some(start),
            (_, end) => end,
        };
        Self {
            path: path.into(),
            start_line,
            end_line,
        }
    }

    /// The line the location is anchored to, preferring the end of a range
    /// (GitHub anchors multi-line review comments on their last line).
    pub fn anchor_line(&self) -> Option<usize> {
        self.end_line.or(self.start_line)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start_line, self.end_line) {
            (Some(start), Some(end)) if end != start => {
                write!(f, "{}:{}-{}", self.path, start, end)
            }
            (Some(line), _) | (None, Some(line)) => write!(f, "{}:{}", self.path, line),
            (None, None) => write!(f, "{}", self.path),
        }
    }
}

/// Where a comment was left on the pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    /// Inline review comment anchored to a diff line
    ReviewComment,
    /// General conversation comment on the pull request
    Discussion,
}

/// A raw review remark as ingested from the collaboration backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    /// Backend-global identifier used for minimize calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub author: String,
    pub body: String,
    pub thread_kind: ThreadKind,
    pub created_at: DateTime<Utc>,
    /// Derived: true iff every owned item is resolved.
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    InReview,
    Resolved,
}

impl ItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::InReview => "IN_REVIEW",
            ItemStatus::Resolved => "RESOLVED",
        }
    }
}

/// An atomic, independently resolvable unit extracted from a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub parent_comment_id: String,
    /// Position in the deterministic processing order.
    pub sequence: usize,
    pub summary: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub status: ItemStatus,
}

impl Item {
    /// Item ids are `<comment_id>.<n>` with `n` starting at 1.
    pub fn make_id(comment_id: &str, ordinal: usize) -> String {
        format!("{}.{}", comment_id, ordinal + 1)
    }

    pub fn summary_line(&self) -> SummaryLine {
        SummaryLine::from_item(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Fixed,
    Ignored,
    Obsolete,
    Deferred,
    Duplicate,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Fixed => "FIXED",
            Outcome::Ignored => "IGNORED",
            Outcome::Obsolete => "OBSOLETE",
            Outcome::Deferred => "DEFERRED",
            Outcome::Duplicate => "DUPLICATE",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIXED" | "FIX" => Ok(Outcome::Fixed),
            "IGNORED" | "IGNORE" => Ok(Outcome::Ignored),
            "OBSOLETE" => Ok(Outcome::Obsolete),
            "DEFERRED" | "DEFER" => Ok(Outcome::Deferred),
            "DUPLICATE" => Ok(Outcome::Duplicate),
            other => Err(format!(
                "unknown outcome '{}' (expected one of FIXED, IGNORED, OBSOLETE, DEFERRED, DUPLICATE)",
                other
            )),
        }
    }
}

/// The immutable outcome recorded for an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub item_id: String,
    pub outcome: Outcome,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_issue: Option<String>,
    pub decided_at: DateTime<Utc>,
    /// 1 for the first record; superseding records use higher revisions.
    #[serde(default = "first_revision")]
    pub revision: u32,
}

fn first_revision() -> u32 {
    1
}

/// Detected or user-declared tooling handed to the fixer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_command: Option<String>,
    /// Which repository marker produced the commands ("cargo", "npm", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_from: Option<String>,
}

/// The sole resumption checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub pr: PullRequestRef,
    pub current_item_index: usize,
    pub total_items: usize,
    pub initialized_at: DateTime<Utc>,
}

impl RunState {
    pub fn is_complete(&self) -> bool {
        self.current_item_index >= self.total_items
    }
}

/// `owner/repo#number`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

fn short_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)#(\d+)$").expect("valid regex")
    })
}

fn pull_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)/pull/(\d+)(?:[/?#].*)?$")
            .expect("valid regex")
    })
}

impl PullRequestRef {
    /// Parse `owner/repo#N` or a GitHub pull request URL.
    ///
    /// A bare number is accepted only when a default owner/repo is supplied
    /// (usually discovered from the git remote).
    pub fn parse(input: &str, default_repo: Option<(&str, &str)>) -> Result<Self, String> {
        let input = input.trim();
        let captures = short_ref_pattern()
            .captures(input)
            .or_else(|| pull_url_pattern().captures(input));
        if let Some(caps) = captures {
            let number = caps[3]
                .parse::<u64>()
                .map_err(|e| format!("invalid pull request number: {}", e))?;
            return Ok(Self {
                owner: caps[1].to_string(),
                repo: caps[2].to_string(),
                number,
            });
        }

        let bare = input.trim_start_matches('#');
        if let Ok(number) = bare.parse::<u64>() {
            return match default_repo {
                Some((owner, repo)) => Ok(Self {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    number,
                }),
                None => Err(format!(
                    "'{}' needs an owner/repo (no GitHub remote found); use owner/repo#{}",
                    input, number
                )),
            };
        }

        Err(format!(
            "unrecognised pull request reference '{}' (expected owner/repo#N, a pull URL, or N)",
            input
        ))
    }
}

const ID_WIDTH: usize = 14;
const CATEGORY_WIDTH: usize = 14;
const LOCATION_WIDTH: usize = 28;
const SUMMARY_WIDTH: usize = 72;

/// The fixed-width, one-line view of an item surfaced by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryLine {
    pub item_id: String,
    pub category: String,
    pub location: String,
    pub summary: String,
}

impl SummaryLine {
    pub fn from_item(item: &Item) -> Self {
        Self {
            item_id: item.id.clone(),
            category: item.category.clone(),
            location: item
                .location
                .as_ref()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
            summary: collapse_whitespace(&item.summary),
        }
    }
}

impl fmt::Display for SummaryLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            pad_to_width(&truncate_to_width(&self.item_id, ID_WIDTH), ID_WIDTH),
            pad_to_width(&truncate_to_width(&self.category, CATEGORY_WIDTH), CATEGORY_WIDTH),
            pad_to_width(&truncate_to_width(&self.location, LOCATION_WIDTH), LOCATION_WIDTH),
            pad_to_width(&truncate_to_width(&self.summary, SUMMARY_WIDTH), SUMMARY_WIDTH),
        )
    }
}
