//! Orchestrator
//!
//! Drives one item at a time through PENDING → IN_REVIEW → RESOLVED. Its
//! only mutable state is the persisted run state; bundles and results stay
//! on disk and callers see summary lines only.

use crate::context::ContextAssembler;
use crate::recorder::{DecisionInput, DecisionRecorder};
use sift_adapters::capability::parse_capability_result;
use sift_adapters::store::StateStore;
use sift_core::{
    BundleKind, BundleRef, CapabilityResult, CollaborationBackend, Confidence, Decision,
    DispatchError, Evaluator, FixReport, Fixer, Item, ItemStatus, Outcome, Recommendation,
    RunState, StoreError, SummaryLine, TriageError, TriageResult,
};
use std::fs;
use std::io::ErrorKind;

/// How far `step` may go on its own.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    /// Recommendations below this confidence are left for a human.
    pub min_confidence: Confidence,
    pub accept_duplicates: bool,
    /// Open a tracking issue for DEFERRED recommendations.
    pub file_deferred_issues: bool,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            min_confidence: Confidence::Medium,
            accept_duplicates: true,
            file_deferred_issues: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A decision was recorded and the cursor moved on.
    Decided { outcome: Outcome },
    /// The item is IN_REVIEW and waits for `sift decide`.
    NeedsDecision { reason: String },
    /// Every item is resolved.
    Complete,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub item: Option<SummaryLine>,
    pub outcome: StepOutcome,
    pub next: Option<SummaryLine>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub resolved: usize,
    pub in_review: usize,
    pub pending: usize,
    pub total: usize,
    pub comments_resolved: usize,
    pub comments_total: usize,
    pub current_index: usize,
}

impl StatusCounts {
    pub fn is_complete(&self) -> bool {
        self.resolved == self.total
    }
}

pub struct Orchestrator {
    store: StateStore,
    assembler: ContextAssembler,
    recorder: DecisionRecorder,
    evaluator: Box<dyn Evaluator>,
    fixer: Box<dyn Fixer>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        assembler: ContextAssembler,
        recorder: DecisionRecorder,
        evaluator: Box<dyn Evaluator>,
        fixer: Box<dyn Fixer>,
    ) -> Self {
        Self {
            store,
            assembler,
            recorder,
            evaluator,
            fixer,
        }
    }

    /// Open an existing run, repairing anything an interrupted decision
    /// write left half done.
    pub fn open(
        store: StateStore,
        assembler: ContextAssembler,
        recorder: DecisionRecorder,
        evaluator: Box<dyn Evaluator>,
        fixer: Box<dyn Fixer>,
    ) -> TriageResult<Self> {
        let report = store.reconcile()?;
        if !report.is_clean() {
            tracing::warn!(
                items = ?report.items_repaired,
                comments = ?report.comments_updated,
                "repaired state from an interrupted run"
            );
        }
        Ok(Self::new(store, assembler, recorder, evaluator, fixer))
    }

    /// The item at the cursor, if any remain.
    pub fn current_item(&self) -> TriageResult<Option<Item>> {
        let run = self.store.load_run_state()?;
        self.item_at(run.current_item_index)
    }

    /// One-line view of the item at the cursor.
    pub fn brief(&self) -> TriageResult<Option<SummaryLine>> {
        Ok(self.current_item()?.map(|item| item.summary_line()))
    }

    /// Move the cursor past resolved items. Never skips an unresolved item,
    /// and only writes the run state when the cursor actually moved.
    pub fn advance(&self) -> TriageResult<RunState> {
        let mut run = self.store.load_run_state()?;
        let start = run.current_item_index;
        while run.current_item_index < run.total_items {
            match self.item_at(run.current_item_index)? {
                Some(item) if item.status == ItemStatus::Resolved => run.current_item_index += 1,
                _ => break,
            }
        }
        if run.current_item_index != start {
            self.store.save_run_state(&run)?;
            tracing::debug!(
                from = start,
                to = run.current_item_index,
                total = run.total_items,
                "cursor advanced"
            );
        }
        Ok(run)
    }

    /// Materialise the evaluation bundle for the current item and mark it
    /// IN_REVIEW.
    pub fn begin_evaluation(&self) -> TriageResult<BundleRef> {
        let mut item = self.require_current()?;
        let bundle = self.assembler.evaluation_bundle(&item.id)?;
        if item.status == ItemStatus::Pending {
            item.status = ItemStatus::InReview;
            self.store.save_item(&item)?;
            tracing::info!(item = %item.id, status = item.status.label(), "item status changed");
        }
        Ok(bundle)
    }

    /// Evaluate the current item. On failure the item stays IN_REVIEW and
    /// the error is retryable.
    pub fn evaluate(&self) -> TriageResult<(SummaryLine, Recommendation)> {
        let bundle = self.begin_evaluation()?;
        let line = self.summary_for(&bundle.item_id)?;
        tracing::info!(item = %bundle.item_id, "dispatching evaluator");
        match self.evaluator.evaluate(&bundle) {
            Ok(recommendation) => {
                tracing::info!(
                    item = %bundle.item_id,
                    outcome = %recommendation.recommended_outcome,
                    confidence = ?recommendation.confidence,
                    "evaluation received"
                );
                Ok((line, recommendation))
            }
            Err(err) => {
                tracing::warn!(item = %bundle.item_id, error = %err, "evaluation failed; item stays in review");
                Err(err.into())
            }
        }
    }

    /// The last evaluation written for the current item, if any.
    pub fn last_recommendation(&self) -> TriageResult<Option<Recommendation>> {
        let item = self.require_current()?;
        let path = self.store.result_path(&item.id, BundleKind::Evaluate);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err).into()),
        };
        match parse_capability_result::<Recommendation>(&raw) {
            Ok(CapabilityResult::Ok { payload }) => Ok(Some(payload)),
            Ok(CapabilityResult::Failed { .. }) => Ok(None),
            Err(message) => Err(DispatchError::Malformed {
                capability: "evaluator",
                message,
            }
            .into()),
        }
    }

    /// Materialise the fix bundle for the current item.
    pub fn fix_bundle(&self, recommendation: &Recommendation) -> TriageResult<BundleRef> {
        let item = self.require_current()?;
        Ok(self.assembler.fix_bundle(&item.id, recommendation)?)
    }

    /// Ask the fixer for a commit. A report without one is an error.
    pub fn request_fix(&self, recommendation: &Recommendation) -> TriageResult<FixReport> {
        let bundle = self.fix_bundle(recommendation)?;
        tracing::info!(item = %bundle.item_id, "dispatching fixer");
        let report = self.fixer.fix(&bundle)?;
        if report.commit().is_none() {
            tracing::warn!(item = %bundle.item_id, "fixer reported no commit");
            return Err(DispatchError::NoCommit {
                item_id: bundle.item_id,
            }
            .into());
        }
        Ok(report)
    }

    /// Record a decision, then advance past it.
    pub fn decide(&self, input: DecisionInput) -> TriageResult<(Decision, Option<SummaryLine>)> {
        let decision = self.recorder.record(input)?;
        self.advance()?;
        Ok((decision, self.brief()?))
    }

    /// One full pass over the current item: evaluate, fix or file an issue
    /// when needed, record, advance.
    pub async fn step(
        &self,
        policy: &StepPolicy,
        backend: Option<&dyn CollaborationBackend>,
    ) -> TriageResult<StepReport> {
        self.advance()?;
        if self.current_item()?.is_none() {
            return Ok(StepReport {
                item: None,
                outcome: StepOutcome::Complete,
                next: None,
            });
        }

        let (line, recommendation) = self.evaluate()?;
        let waiting = |reason: String| StepReport {
            item: Some(line.clone()),
            outcome: StepOutcome::NeedsDecision { reason },
            next: None,
        };

        if recommendation.confidence < policy.min_confidence {
            return Ok(waiting(format!(
                "evaluator is only {:?}-confidence about {}",
                recommendation.confidence, recommendation.recommended_outcome
            )));
        }

        let reasoning = recommendation.reasoning.clone();
        let input = match recommendation.recommended_outcome {
            Outcome::Fixed if recommendation.already_fixed => {
                DecisionInput::new(&line.item_id, Outcome::Obsolete, reasoning)
            }
            Outcome::Fixed => {
                let report = self.request_fix(&recommendation)?;
                let commit = report.commit().unwrap_or_default().to_string();
                DecisionInput::new(&line.item_id, Outcome::Fixed, reasoning).with_commit(commit)
            }
            Outcome::Duplicate => {
                if !policy.accept_duplicates {
                    return Ok(waiting("duplicate recommended; confirm with `sift decide duplicate`".to_string()));
                }
                let candidate = recommendation.duplicate_candidate.clone().unwrap_or_default();
                let root = self.duplicate_root(&candidate)?;
                DecisionInput::new(&line.item_id, Outcome::Duplicate, reasoning).with_duplicate_of(root)
            }
            Outcome::Deferred => {
                let Some(backend) = backend.filter(|_| policy.file_deferred_issues) else {
                    return Ok(waiting("deferral needs a tracking issue; use `sift decide deferred --issue`".to_string()));
                };
                let run = self.store.load_run_state()?;
                let title = format!("Follow-up from {}: {}", run.pr, recommendation.summary);
                let body = format!(
                    "Deferred during review of {}.\n\n> {}\n\n{}",
                    run.pr, line.summary, recommendation.reasoning
                );
                let issue = backend.create_issue(&run.pr, &title, &body).await?;
                tracing::info!(item = %line.item_id, issue = %issue, "tracking issue created");
                DecisionInput::new(&line.item_id, Outcome::Deferred, reasoning).with_linked_issue(issue)
            }
            outcome => DecisionInput::new(&line.item_id, outcome, reasoning),
        };

        let (decision, next) = self.decide(input)?;
        Ok(StepReport {
            item: Some(line),
            outcome: StepOutcome::Decided {
                outcome: decision.outcome,
            },
            next,
        })
    }

    /// Resolved / in-review / pending counts as currently on disk.
    pub fn status(&self) -> TriageResult<StatusCounts> {
        let run = self.store.load_run_state()?;
        let mut counts = StatusCounts {
            current_index: run.current_item_index,
            ..StatusCounts::default()
        };
        for item in self.store.load_items()? {
            counts.total += 1;
            match item.status {
                ItemStatus::Resolved => counts.resolved += 1,
                ItemStatus::InReview => counts.in_review += 1,
                ItemStatus::Pending => counts.pending += 1,
            }
        }
        for comment in self.store.load_comments()? {
            counts.comments_total += 1;
            if comment.resolved {
                counts.comments_resolved += 1;
            }
        }
        Ok(counts)
    }

    fn item_at(&self, index: usize) -> TriageResult<Option<Item>> {
        let Some(item_id) = self.store.item_id_at(index)? else {
            return Ok(None);
        };
        let item = self.store.load_item(&item_id)?.ok_or_else(|| StoreError::Missing {
            path: format!("items/{}", item_id),
        })?;
        Ok(Some(item))
    }

    fn require_current(&self) -> TriageResult<Item> {
        self.advance()?;
        self.current_item()?.ok_or(TriageError::NoCurrentItem)
    }

    fn summary_for(&self, item_id: &str) -> TriageResult<SummaryLine> {
        let item = self.store.load_item(item_id)?.ok_or_else(|| StoreError::Missing {
            path: format!("items/{}", item_id),
        })?;
        Ok(item.summary_line())
    }

    /// Point a duplicate at the decision it ultimately repeats.
    fn duplicate_root(&self, target: &str) -> TriageResult<String> {
        let mut current = target.trim().to_string();
        // One hop is enough: stored duplicates never point at duplicates.
        if let Some(decision) = self.store.load_decision(&current)? {
            if decision.outcome == Outcome::Duplicate {
                if let Some(root) = decision.duplicate_of {
                    current = root;
                }
            }
        }
        Ok(current)
    }
}
