//! Sync Engine
//!
//! Pushes each resolved comment's outcome back upstream: one reply, then a
//! minimize with a reason code. A per-comment marker makes re-runs skip
//! whatever already went through.

use chrono::Utc;
use sift_adapters::store::{StateStore, SyncMarker};
use sift_core::{
    CollaborationBackend, Comment, Decision, Item, MinimizeReason, Outcome, PullRequestRef,
    SyncError, TriageResult,
};

/// One comment's planned (or performed) upstream action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAction {
    pub comment_id: String,
    pub reason: MinimizeReason,
    pub reply: String,
    /// A reply was already posted on an earlier run.
    pub reply_posted: bool,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<String>,
    /// Comments whose marker says they are done.
    pub skipped: Vec<String>,
    /// Planned actions; only filled on a dry run.
    pub planned: Vec<SyncAction>,
    pub failed: Vec<(String, SyncError)>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// A single reason for the whole comment: the shared one when every item
/// ended the same way, otherwise RESOLVED.
pub fn consolidated_reason(decisions: &[Decision]) -> MinimizeReason {
    let mut reasons = decisions.iter().map(|d| MinimizeReason::from(d.outcome));
    let Some(first) = reasons.next() else {
        return MinimizeReason::Resolved;
    };
    if reasons.all(|reason| reason == first) {
        first
    } else {
        MinimizeReason::Resolved
    }
}

fn describe(decision: &Decision) -> String {
    let detail = match decision.outcome {
        Outcome::Fixed => format!(
            "fixed in {}",
            decision.commit_ref.as_deref().unwrap_or("a follow-up commit")
        ),
        Outcome::Ignored => "won't fix".to_string(),
        Outcome::Obsolete => "no longer applies".to_string(),
        Outcome::Deferred => format!(
            "deferred to {}",
            decision.linked_issue.as_deref().unwrap_or("a tracking issue")
        ),
        Outcome::Duplicate => format!(
            "duplicate of item {}",
            decision.duplicate_of.as_deref().unwrap_or("?")
        ),
    };
    let reasoning = decision.reasoning.trim();
    if reasoning.is_empty() {
        format!("**{}**: {}.", decision.outcome, detail)
    } else {
        format!("**{}**: {}. {}", decision.outcome, detail, reasoning)
    }
}

/// Reply text summarising how each item of a comment was resolved.
pub fn compose_reply(items: &[(Item, Decision)]) -> String {
    match items {
        [(_, decision)] => describe(decision),
        _ => {
            let lines: Vec<String> = items
                .iter()
                .map(|(item, decision)| format!("- {}: {}", item.summary, describe(decision)))
                .collect();
            format!("Resolved {} points:\n\n{}", items.len(), lines.join("\n"))
        }
    }
}

pub struct SyncEngine<'a> {
    store: &'a StateStore,
    backend: &'a dyn CollaborationBackend,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a StateStore, backend: &'a dyn CollaborationBackend) -> Self {
        Self { store, backend }
    }

    /// Sync every resolved comment that has not been fully synced yet.
    /// Per-comment failures are collected; the rest still go through.
    pub async fn run(&self, dry_run: bool) -> TriageResult<SyncReport> {
        let pr = self.store.load_run_state()?.pr;
        let mut report = SyncReport::default();

        for comment in self.store.load_comments()? {
            if !comment.resolved {
                continue;
            }
            let marker = self.store.load_sync_marker(&comment.id)?;
            if marker.as_ref().is_some_and(SyncMarker::is_complete) {
                tracing::debug!(comment = %comment.id, "already synced; skipping");
                report.skipped.push(comment.id.clone());
                continue;
            }

            let Some(action) = self.plan(&comment, marker.as_ref())? else {
                continue;
            };
            if dry_run {
                report.planned.push(action);
                continue;
            }

            match self.push(&pr, &comment, &action, marker).await? {
                Ok(()) => report.synced.push(comment.id.clone()),
                Err(err) => {
                    tracing::warn!(comment = %comment.id, error = %err, "sync failed; will retry on next run");
                    report.failed.push((comment.id.clone(), err));
                }
            }
        }
        Ok(report)
    }

    fn plan(&self, comment: &Comment, marker: Option<&SyncMarker>) -> TriageResult<Option<SyncAction>> {
        let mut resolved = Vec::new();
        for item in self.store.load_items_for_comment(&comment.id)? {
            match self.store.load_decision(&item.id)? {
                Some(decision) => resolved.push((item, decision)),
                None => {
                    tracing::warn!(item = %item.id, "resolved comment has an undecided item; skipping");
                    return Ok(None);
                }
            }
        }
        if resolved.is_empty() {
            return Ok(None);
        }
        let decisions: Vec<Decision> = resolved.iter().map(|(_, d)| d.clone()).collect();
        Ok(Some(SyncAction {
            comment_id: comment.id.clone(),
            reason: consolidated_reason(&decisions),
            reply: compose_reply(&resolved),
            reply_posted: marker.is_some_and(|m| m.reply_id.is_some()),
        }))
    }

    /// Reply (unless an earlier run already did), then minimize. The marker
    /// is saved after each confirmed step. Store failures abort the whole
    /// run; backend failures are returned per comment.
    async fn push(
        &self,
        pr: &PullRequestRef,
        comment: &Comment,
        action: &SyncAction,
        marker: Option<SyncMarker>,
    ) -> TriageResult<Result<(), SyncError>> {
        let mut marker = marker.unwrap_or_else(|| SyncMarker::new(&comment.id, action.reason));
        marker.reason = action.reason;

        if marker.reply_id.is_none() {
            match self.backend.post_reply(pr, comment, &action.reply).await {
                Ok(reply_id) => {
                    tracing::info!(comment = %comment.id, reply = %reply_id, "reply posted");
                    marker.reply_id = Some(reply_id);
                    marker.replied_at = Some(Utc::now());
                    self.store.save_sync_marker(&marker)?;
                }
                Err(err) => return Ok(Err(err)),
            }
        }

        if let Err(err) = self.backend.minimize_comment(comment, action.reason).await {
            return Ok(Err(err));
        }
        marker.minimized_at = Some(Utc::now());
        self.store.save_sync_marker(&marker)?;
        tracing::info!(comment = %comment.id, reason = action.reason.classifier(), "comment minimized");
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{DecisionInput, DecisionRecorder};
    use crate::testing::{comment_at, seeded_store, FakeBackend};
    use sift_core::ItemStatus;
    use std::sync::atomic::Ordering;

    fn decision(outcome: Outcome) -> Decision {
        Decision {
            item_id: "1.1".to_string(),
            outcome,
            reasoning: String::new(),
            commit_ref: Some("abc123".to_string()),
            duplicate_of: None,
            linked_issue: None,
            decided_at: Utc::now(),
            revision: 1,
        }
    }

    fn resolve(store: &StateStore, input: DecisionInput) {
        let mut item = store.load_item(&input.item_id).unwrap().unwrap();
        item.status = ItemStatus::InReview;
        store.save_item(&item).unwrap();
        DecisionRecorder::new(store.clone()).record(input).unwrap();
    }

    #[test]
    fn consolidated_reason_uses_shared_outcome_or_resolved() {
        assert_eq!(
            consolidated_reason(&[decision(Outcome::Ignored), decision(Outcome::Ignored)]),
            MinimizeReason::OffTopic
        );
        assert_eq!(
            consolidated_reason(&[decision(Outcome::Ignored), decision(Outcome::Obsolete)]),
            MinimizeReason::Resolved
        );
        assert_eq!(
            consolidated_reason(&[decision(Outcome::Deferred)]),
            MinimizeReason::Resolved
        );
        assert_eq!(consolidated_reason(&[]), MinimizeReason::Resolved);
    }

    #[tokio::test]
    async fn sync_posts_once_and_skips_on_rerun() {
        let (_dir, store) = seeded_store(vec![comment_at("1", "use async for this call", "src/x.py", 10, 0)]);
        resolve(
            &store,
            DecisionInput::new("1.1", Outcome::Fixed, "switched to aiohttp").with_commit("abc123"),
        );
        let backend = FakeBackend::default();
        let engine = SyncEngine::new(&store, &backend);

        let report = engine.run(false).await.unwrap();
        assert_eq!(report.synced, vec!["1".to_string()]);
        {
            let replies = backend.replies.lock().unwrap();
            assert_eq!(replies.len(), 1);
            assert!(replies[0].1.contains("fixed in abc123"));
        }
        assert_eq!(
            *backend.minimized.lock().unwrap(),
            vec![("1".to_string(), MinimizeReason::Resolved)]
        );

        let again = engine.run(false).await.unwrap();
        assert_eq!(again.skipped, vec!["1".to_string()]);
        assert_eq!(backend.replies.lock().unwrap().len(), 1);
        assert_eq!(backend.minimized.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_minimize_retries_without_reposting() {
        let (_dir, store) = seeded_store(vec![comment_at("1", "rename tmp", "a.rs", 1, 0)]);
        resolve(&store, DecisionInput::new("1.1", Outcome::Ignored, "style"));
        let backend = FakeBackend::default();
        backend.failing_minimizes.store(1, Ordering::SeqCst);
        let engine = SyncEngine::new(&store, &backend);

        let first = engine.run(false).await.unwrap();
        assert!(first.has_failures());
        let marker = store.load_sync_marker("1").unwrap().unwrap();
        assert!(marker.reply_id.is_some());
        assert!(!marker.is_complete());

        let second = engine.run(false).await.unwrap();
        assert_eq!(second.synced, vec!["1".to_string()]);
        assert_eq!(backend.replies.lock().unwrap().len(), 1);
        assert_eq!(
            *backend.minimized.lock().unwrap(),
            vec![("1".to_string(), MinimizeReason::OffTopic)]
        );
        assert!(store.load_sync_marker("1").unwrap().unwrap().is_complete());
    }

    #[tokio::test]
    async fn unresolved_comments_are_left_alone_and_dry_run_touches_nothing() {
        let (_dir, store) = seeded_store(vec![
            comment_at("1", "- rename tmp\n- add a test for empty input\n", "a.rs", 1, 0),
            comment_at("2", "drop this helper", "a.rs", 9, 1),
        ]);
        resolve(&store, DecisionInput::new("1.1", Outcome::Ignored, "fine"));
        resolve(&store, DecisionInput::new("2.1", Outcome::Obsolete, "helper removed"));
        let backend = FakeBackend::default();
        let engine = SyncEngine::new(&store, &backend);

        let report = engine.run(true).await.unwrap();
        assert_eq!(report.planned.len(), 1);
        assert_eq!(report.planned[0].comment_id, "2");
        assert_eq!(report.planned[0].reason, MinimizeReason::Outdated);
        assert!(backend.replies.lock().unwrap().is_empty());
        assert!(store.load_sync_marker("2").unwrap().is_none());
    }

    #[test]
    fn multi_item_reply_lists_each_point() {
        let (_dir, store) = seeded_store(vec![comment_at(
            "1",
            "- rename tmp\n- add a test for empty input\n",
            "a.rs",
            1,
            0,
        )]);
        let items = store.load_items_for_comment("1").unwrap();
        let mut fixed = decision(Outcome::Fixed);
        fixed.item_id = "1.2".to_string();
        let mut deferred = decision(Outcome::Deferred);
        deferred.commit_ref = None;
        deferred.linked_issue = Some("#12".to_string());
        let pairs = vec![(items[0].clone(), deferred), (items[1].clone(), fixed)];
        let reply = compose_reply(&pairs);
        assert!(reply.starts_with("Resolved 2 points:"));
        assert!(reply.contains("- rename tmp: **DEFERRED**: deferred to #12."));
        assert!(reply.contains("**FIXED**: fixed in abc123."));
    }
}
