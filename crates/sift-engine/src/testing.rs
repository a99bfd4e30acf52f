//! Fixtures shared by the engine's unit tests.

use crate::ingest::build_snapshot;
use chrono::{TimeZone, Utc};
use sift_adapters::store::StateStore;
use sift_core::{
    BackendFuture, BundleRef, CollaborationBackend, Comment, Confidence, DispatchError,
    Evaluator, FixReport, Fixer, IngestError, Location, MinimizeReason, Outcome, ProjectConfig,
    PullRequestRef, Recommendation, SyncError, ThreadKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) fn pr() -> PullRequestRef {
    PullRequestRef {
        owner: "acme".to_string(),
        repo: "widgets".to_string(),
        number: 7,
    }
}

pub(crate) fn comment_at(id: &str, body: &str, path: &str, line: usize, minute: u32) -> Comment {
    Comment {
        id: id.to_string(),
        node_id: Some(format!("NODE_{}", id)),
        location: Some(Location::new(path, Some(line), None)),
        author: "reviewer".to_string(),
        body: body.to_string(),
        thread_kind: ThreadKind::ReviewComment,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        resolved: false,
    }
}

/// An initialised store in a fresh temp dir.
pub(crate) fn seeded_store(comments: Vec<Comment>) -> (tempfile::TempDir, StateStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let snapshot = build_snapshot(&pr(), comments, ProjectConfig::default(), Utc::now());
    store.initialize(&snapshot, false).unwrap();
    (dir, store)
}

pub(crate) fn recommend(outcome: Outcome) -> Recommendation {
    Recommendation {
        summary: format!("recommend {}", outcome),
        already_fixed: false,
        duplicate_candidate: None,
        recommended_outcome: outcome,
        confidence: Confidence::High,
        reasoning: "looks right".to_string(),
    }
}

/// Backend that records every call instead of talking to a server.
#[derive(Default)]
pub(crate) struct FakeBackend {
    comments: Vec<Comment>,
    unreachable: bool,
    fetches: AtomicUsize,
    pub replies: Mutex<Vec<(String, String)>>,
    pub minimized: Mutex<Vec<(String, MinimizeReason)>>,
    pub issues: Mutex<Vec<String>>,
    /// Minimize calls to reject before succeeding.
    pub failing_minimizes: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn with_comments(comments: Vec<Comment>) -> Self {
        Self {
            comments,
            ..Self::default()
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl CollaborationBackend for FakeBackend {
    fn fetch_comments<'a>(
        &'a self,
        _pr: &'a PullRequestRef,
    ) -> BackendFuture<'a, Vec<Comment>, IngestError> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(IngestError::Unreachable {
                    message: "connection refused".to_string(),
                });
            }
            Ok(self.comments.clone())
        })
    }

    fn post_reply<'a>(
        &'a self,
        _pr: &'a PullRequestRef,
        comment: &'a Comment,
        body: &'a str,
    ) -> BackendFuture<'a, String, SyncError> {
        Box::pin(async move {
            let mut replies = self.replies.lock().unwrap();
            replies.push((comment.id.clone(), body.to_string()));
            Ok(format!("reply-{}", replies.len()))
        })
    }

    fn minimize_comment<'a>(
        &'a self,
        comment: &'a Comment,
        reason: MinimizeReason,
    ) -> BackendFuture<'a, (), SyncError> {
        Box::pin(async move {
            let remaining = self.failing_minimizes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_minimizes.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Rejected {
                    action: "minimize",
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
            self.minimized
                .lock()
                .unwrap()
                .push((comment.id.clone(), reason));
            Ok(())
        })
    }

    fn create_issue<'a>(
        &'a self,
        _pr: &'a PullRequestRef,
        title: &'a str,
        _body: &'a str,
    ) -> BackendFuture<'a, String, SyncError> {
        Box::pin(async move {
            let mut issues = self.issues.lock().unwrap();
            issues.push(title.to_string());
            Ok(format!("#{}", 100 + issues.len()))
        })
    }
}

/// Evaluator answering from a per-item script; unknown items are "unavailable".
#[derive(Default)]
pub(crate) struct ScriptedEvaluator {
    pub answers: HashMap<String, Recommendation>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEvaluator {
    pub(crate) fn answering(answers: &[(&str, Recommendation)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(id, rec)| (id.to_string(), rec.clone()))
                .collect(),
            calls: Arc::default(),
        }
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, bundle: &BundleRef) -> Result<Recommendation, DispatchError> {
        self.calls.lock().unwrap().push(bundle.item_id.clone());
        self.answers
            .get(&bundle.item_id)
            .cloned()
            .ok_or_else(|| DispatchError::Unavailable {
                capability: "evaluator",
                message: "no scripted answer".to_string(),
            })
    }
}

/// Fixer that always commits, or never does.
pub(crate) struct StaticFixer {
    pub commit: Option<String>,
}

impl Fixer for StaticFixer {
    fn fix(&self, _bundle: &BundleRef) -> Result<FixReport, DispatchError> {
        Ok(FixReport {
            files_changed: vec!["src/x.py".to_string()],
            commit_ref: self.commit.clone(),
            verification: vec!["pytest".to_string()],
        })
    }
}
