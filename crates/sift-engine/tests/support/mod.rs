//! In-memory backend and scripted capabilities for scenario tests.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use sift_adapters::store::StateStore;
use sift_core::duplicates::DuplicateDetector;
use sift_core::{
    BackendFuture, BundleRef, CollaborationBackend, Comment, Confidence, DispatchError,
    Evaluator, FixReport, Fixer, IngestError, Location, MinimizeReason, Outcome, PullRequestRef,
    Recommendation, SyncError, ThreadKind,
};
use sift_engine::{ContextAssembler, DecisionRecorder, Orchestrator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn pr() -> PullRequestRef {
    PullRequestRef::parse("acme/widgets#42", None).unwrap()
}

pub fn review_comment(id: &str, body: &str, path: &str, line: usize, minute: u32) -> Comment {
    Comment {
        id: id.to_string(),
        node_id: Some(format!("PRRC_{}", id)),
        location: Some(Location::new(path, Some(line), None)),
        author: "reviewer".to_string(),
        body: body.to_string(),
        thread_kind: ThreadKind::ReviewComment,
        created_at: Utc.with_ymd_and_hms(2024, 6, 3, 9, minute, 0).unwrap(),
        resolved: false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Reply { comment_id: String, body: String },
    Minimize { comment_id: String, reason: MinimizeReason },
    Issue { title: String },
}

/// Serves a fixed comment list and records every write.
#[derive(Default)]
pub struct RecordingBackend {
    comments: Vec<Comment>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingBackend {
    pub fn new(comments: Vec<Comment>) -> Self {
        Self {
            comments,
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl CollaborationBackend for RecordingBackend {
    fn fetch_comments<'a>(
        &'a self,
        _pr: &'a PullRequestRef,
    ) -> BackendFuture<'a, Vec<Comment>, IngestError> {
        Box::pin(async move { Ok(self.comments.clone()) })
    }

    fn post_reply<'a>(
        &'a self,
        _pr: &'a PullRequestRef,
        comment: &'a Comment,
        body: &'a str,
    ) -> BackendFuture<'a, String, SyncError> {
        Box::pin(async move {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call::Reply {
                comment_id: comment.id.clone(),
                body: body.to_string(),
            });
            Ok(format!("{}", 9000 + calls.len()))
        })
    }

    fn minimize_comment<'a>(
        &'a self,
        comment: &'a Comment,
        reason: MinimizeReason,
    ) -> BackendFuture<'a, (), SyncError> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(Call::Minimize {
                comment_id: comment.id.clone(),
                reason,
            });
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
            self.calls.lock().unwrap().push(Call::Issue {
                title: title.to_string(),
            });
            Ok("#77".to_string())
        })
    }
}

/// Answers by item id and keeps the bundles it was handed.
#[derive(Default, Clone)]
pub struct ScriptedEvaluator {
    answers: Arc<HashMap<String, Recommendation>>,
    pub seen: Arc<Mutex<Vec<BundleRef>>>,
}

impl ScriptedEvaluator {
    pub fn new(answers: Vec<(&str, Recommendation)>) -> Self {
        Self {
            answers: Arc::new(
                answers
                    .into_iter()
                    .map(|(id, rec)| (id.to_string(), rec))
                    .collect(),
            ),
            seen: Arc::default(),
        }
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, bundle: &BundleRef) -> Result<Recommendation, DispatchError> {
        self.seen.lock().unwrap().push(bundle.clone());
        self.answers
            .get(&bundle.item_id)
            .cloned()
            .ok_or_else(|| DispatchError::Malformed {
                capability: "evaluator",
                message: "empty result".to_string(),
            })
    }
}

pub struct CommittingFixer(pub &'static str);

impl Fixer for CommittingFixer {
    fn fix(&self, _bundle: &BundleRef) -> Result<FixReport, DispatchError> {
        Ok(FixReport {
            files_changed: vec!["src/x.py".to_string()],
            commit_ref: Some(self.0.to_string()),
            verification: vec!["python3 -m pytest -q".to_string()],
        })
    }
}

pub fn recommendation(outcome: Outcome, reasoning: &str) -> Recommendation {
    Recommendation {
        summary: reasoning.to_string(),
        already_fixed: false,
        duplicate_candidate: None,
        recommended_outcome: outcome,
        confidence: Confidence::High,
        reasoning: reasoning.to_string(),
    }
}

pub fn orchestrator(store: &StateStore, evaluator: ScriptedEvaluator) -> Orchestrator {
    Orchestrator::open(
        store.clone(),
        ContextAssembler::new(store.clone(), DuplicateDetector::default(), 8),
        DecisionRecorder::new(store.clone()),
        Box::new(evaluator),
        Box::new(CommittingFixer("abc123")),
    )
    .unwrap()
}
