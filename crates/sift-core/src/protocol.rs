//! Contracts with the external capabilities: the evaluator, the fixer and
//! the collaboration backend.

use crate::error::{DispatchError, IngestError, SyncError};
use crate::model::{Comment, Outcome, PullRequestRef};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Evaluate,
    Fix,
}

impl BundleKind {
    pub fn file_stem(&self) -> &'static str {
        match self {
            BundleKind::Evaluate => "evaluate",
            BundleKind::Fix => "fix",
        }
    }
}

/// Reference to a materialised bundle. Only this travels through the
/// orchestrator; bundle contents stay on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub item_id: String,
    pub kind: BundleKind,
    pub path: PathBuf,
}

/// What the evaluator thinks should happen to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub summary: String,
    #[serde(default)]
    pub already_fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_candidate: Option<String>,
    pub recommended_outcome: Outcome,
    #[serde(default)]
    pub confidence: Confidence,
    pub reasoning: String,
}

impl Recommendation {
    pub fn validate(&self) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("recommendation summary is empty".to_string());
        }
        if self.reasoning.trim().is_empty() {
            return Err("recommendation reasoning is empty".to_string());
        }
        if self.recommended_outcome == Outcome::Duplicate
            && self
                .duplicate_candidate
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err("DUPLICATE recommended without a duplicate_candidate".to_string());
        }
        Ok(())
    }

    /// Whether the fixer should be asked to produce a commit.
    pub fn wants_fix(&self) -> bool {
        self.recommended_outcome == Outcome::Fixed && !self.already_fixed
    }
}

/// What the fixer reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixReport {
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default)]
    pub verification: Vec<String>,
}

impl FixReport {
    pub fn commit(&self) -> Option<&str> {
        self.commit_ref
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Result envelope written by a capability:
/// `{"status":"ok","payload":{...}}` or `{"status":"failed","reason":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityResult<T> {
    Ok { payload: T },
    Failed { reason: String },
}

/// Inspects an evaluation bundle and returns a recommendation.
pub trait Evaluator {
    fn evaluate(&self, bundle: &BundleRef) -> Result<Recommendation, DispatchError>;
}

/// Applies a fix described by a fix bundle and returns a commit reference.
pub trait Fixer {
    fn fix(&self, bundle: &BundleRef) -> Result<FixReport, DispatchError>;
}

/// Reason code attached when a comment is minimized upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MinimizeReason {
    Resolved,
    OffTopic,
    Outdated,
    Duplicate,
}

impl MinimizeReason {
    /// Machine-readable classifier understood by the backend.
    pub fn classifier(&self) -> &'static str {
        match self {
            MinimizeReason::Resolved => "RESOLVED",
            MinimizeReason::OffTopic => "OFF_TOPIC",
            MinimizeReason::Outdated => "OUTDATED",
            MinimizeReason::Duplicate => "DUPLICATE",
        }
    }
}

impl From<Outcome> for MinimizeReason {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Fixed | Outcome::Deferred => MinimizeReason::Resolved,
            Outcome::Ignored => MinimizeReason::OffTopic,
            Outcome::Obsolete => MinimizeReason::Outdated,
            Outcome::Duplicate => MinimizeReason::Duplicate,
        }
    }
}

pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// The version-control / collaboration service holding the pull request.
pub trait CollaborationBackend: Send + Sync {
    fn fetch_comments<'a>(
        &'a self,
        pr: &'a PullRequestRef,
    ) -> BackendFuture<'a, Vec<Comment>, IngestError>;

    /// Post a reply in the comment's thread; returns the reply's id.
    fn post_reply<'a>(
        &'a self,
        pr: &'a PullRequestRef,
        comment: &'a Comment,
        body: &'a str,
    ) -> BackendFuture<'a, String, SyncError>;

    fn minimize_comment<'a>(
        &'a self,
        comment: &'a Comment,
        reason: MinimizeReason,
    ) -> BackendFuture<'a, (), SyncError>;

    /// Create a tracking issue; returns a reference such as `#123`.
    fn create_issue<'a>(
        &'a self,
        pr: &'a PullRequestRef,
        title: &'a str,
        body: &'a str,
    ) -> BackendFuture<'a, String, SyncError>;
}
