//! Decision Recorder
//!
//! The only writer of decision records. Validation happens in a fixed order
//! (item exists, not yet decided, outcome fields, item is IN_REVIEW) and
//! nothing is written unless every check passes.

use chrono::Utc;
use sift_adapters::git_ops;
use sift_adapters::store::StateStore;
use sift_core::{
    Decision, ItemStatus, Outcome, StoreError, TriageResult, ValidationError,
};
use std::path::PathBuf;

/// What the caller wants recorded for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionInput {
    pub item_id: String,
    pub outcome: Outcome,
    pub reasoning: String,
    pub commit_ref: Option<String>,
    pub duplicate_of: Option<String>,
    pub linked_issue: Option<String>,
}

impl DecisionInput {
    pub fn new(item_id: impl Into<String>, outcome: Outcome, reasoning: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            outcome,
            reasoning: reasoning.into(),
            commit_ref: None,
            duplicate_of: None,
            linked_issue: None,
        }
    }

    pub fn with_commit(mut self, commit_ref: impl Into<String>) -> Self {
        self.commit_ref = Some(commit_ref.into());
        self
    }

    pub fn with_duplicate_of(mut self, item_id: impl Into<String>) -> Self {
        self.duplicate_of = Some(item_id.into());
        self
    }

    pub fn with_linked_issue(mut self, issue: impl Into<String>) -> Self {
        self.linked_issue = Some(issue.into());
        self
    }
}

/// Checks that a commit reference exists before a FIXED decision lands.
pub trait CommitVerifier {
    /// `Err` means the check could not run at all.
    fn commit_exists(&self, commit_ref: &str) -> Result<bool, String>;
}

/// Verifies commits against the local git repository.
pub struct GitCommitVerifier {
    repo_root: PathBuf,
}

impl GitCommitVerifier {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

impl CommitVerifier for GitCommitVerifier {
    fn commit_exists(&self, commit_ref: &str) -> Result<bool, String> {
        git_ops::commit_exists(&self.repo_root, commit_ref).map_err(|e| format!("{:#}", e))
    }
}

pub struct DecisionRecorder {
    store: StateStore,
    verifier: Option<Box<dyn CommitVerifier>>,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl DecisionRecorder {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn CommitVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Validate and write a decision, resolve the item and refresh the
    /// parent comment's `resolved` flag.
    pub fn record(&self, input: DecisionInput) -> TriageResult<Decision> {
        let item_id = input.item_id.trim().to_string();
        let mut item = self
            .store
            .load_item(&item_id)?
            .ok_or_else(|| ValidationError::UnknownItem {
                item_id: item_id.clone(),
            })?;

        if item.status == ItemStatus::Resolved || self.store.load_decision(&item.id)?.is_some() {
            return Err(ValidationError::AlreadyResolved { item_id: item.id }.into());
        }

        let commit_ref = non_blank(&input.commit_ref);
        let duplicate_of = non_blank(&input.duplicate_of);
        let linked_issue = non_blank(&input.linked_issue);
        check_field(input.outcome, Outcome::Fixed, "commit", commit_ref.is_some())?;
        check_field(
            input.outcome,
            Outcome::Duplicate,
            "duplicate-of",
            duplicate_of.is_some(),
        )?;
        check_field(input.outcome, Outcome::Deferred, "issue", linked_issue.is_some())?;

        if let Some(target) = &duplicate_of {
            self.check_duplicate_target(&item.id, target)?;
        }
        if let Some(commit) = &commit_ref {
            self.check_commit(commit)?;
        }

        if item.status != ItemStatus::InReview {
            return Err(ValidationError::NotInReview {
                item_id: item.id,
                status: item.status,
            }
            .into());
        }

        let decision = Decision {
            item_id: item.id.clone(),
            outcome: input.outcome,
            reasoning: input.reasoning.trim().to_string(),
            commit_ref,
            duplicate_of,
            linked_issue,
            decided_at: Utc::now(),
            revision: 1,
        };
        match self.store.insert_decision(&decision) {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(ValidationError::AlreadyResolved { item_id: item.id }.into());
            }
            Err(err) => return Err(err.into()),
        }

        item.status = ItemStatus::Resolved;
        self.store.save_item(&item)?;
        tracing::info!(item = %item.id, status = item.status.label(), "item status changed");
        self.refresh_comment(&item.parent_comment_id)?;
        Ok(decision)
    }

    fn check_duplicate_target(&self, item_id: &str, target: &str) -> TriageResult<()> {
        if target == item_id {
            return Err(ValidationError::SelfDuplicate {
                item_id: item_id.to_string(),
            }
            .into());
        }
        let decision = self.store.load_decision(target)?.ok_or_else(|| {
            ValidationError::DuplicateOfUnresolved {
                target: target.to_string(),
            }
        })?;
        if decision.outcome == Outcome::Duplicate {
            return Err(ValidationError::ChainedDuplicate {
                target: target.to_string(),
                root: decision.duplicate_of.unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }

    fn check_commit(&self, commit: &str) -> TriageResult<()> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        match verifier.commit_exists(commit) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ValidationError::UnknownCommit {
                commit_ref: commit.to_string(),
            }
            .into()),
            Err(err) => {
                tracing::warn!(commit, error = %err, "commit verification unavailable; accepting");
                Ok(())
            }
        }
    }

    fn refresh_comment(&self, comment_id: &str) -> TriageResult<()> {
        let siblings = self.store.load_items_for_comment(comment_id)?;
        let resolved = !siblings.is_empty()
            && siblings
                .iter()
                .all(|item| item.status == ItemStatus::Resolved);
        let mut comment = self.store.load_comment(comment_id)?;
        if comment.resolved != resolved {
            comment.resolved = resolved;
            self.store.save_comment(&comment)?;
            tracing::info!(comment = comment_id, resolved, "comment resolution changed");
        }
        Ok(())
    }
}

/// A field is present iff the outcome that owns it was chosen.
fn check_field(
    outcome: Outcome,
    owner: Outcome,
    field: &'static str,
    present: bool,
) -> Result<(), ValidationError> {
    if outcome == owner && !present {
        return Err(ValidationError::MissingField { outcome, field });
    }
    if outcome != owner && present {
        return Err(ValidationError::UnexpectedField {
            outcome,
            field,
            expected: owner,
        });
    }
    Ok(())
}
