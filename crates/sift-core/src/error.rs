//! Error taxonomy shared across the workspace.
//!
//! Adapters translate backend, process and filesystem failures into one of
//! these kinds at their boundary; the orchestrator only ever sees these.

use crate::model::{ItemStatus, Outcome};
use thiserror::Error;

/// Failures while fetching comments for `init`. Fatal to `init`, retryable
/// by running it again.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Collaboration backend unreachable: {message}")]
    Unreachable { message: String },

    #[error("Collaboration backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed comment payload: {message}")]
    MalformedPayload { message: String },

    #[error("Comment listing still had more pages after {pages}; refusing a partial run")]
    TooManyPages { pages: usize },

    #[error("Not authenticated with GitHub; set GITHUB_TOKEN or run `sift auth --token`")]
    NotAuthenticated,
}

/// Evaluator / fixer dispatch failures. Always retryable; the item stays
/// IN_REVIEW.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{capability} unavailable: {message}")]
    Unavailable {
        capability: &'static str,
        message: String,
    },

    #[error("{capability} returned a malformed result: {message}")]
    Malformed {
        capability: &'static str,
        message: String,
    },

    #[error("{capability} reported failure: {reason}")]
    Failed {
        capability: &'static str,
        reason: String,
    },

    #[error("fixer produced no commit for item {item_id}")]
    NoCommit { item_id: String },

    #[error("{capability} not configured (set it in config.json or via {env_var})")]
    NotConfigured {
        capability: &'static str,
        env_var: &'static str,
    },
}

/// Invariant violations on decision write. Nothing is written when one of
/// these is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("item {item_id} not found")]
    UnknownItem { item_id: String },

    #[error("item {item_id} is already resolved; decisions are immutable")]
    AlreadyResolved { item_id: String },

    #[error("{outcome} requires --{field}")]
    MissingField {
        outcome: Outcome,
        field: &'static str,
    },

    #[error("--{field} is only valid for {expected}, not {outcome}")]
    UnexpectedField {
        outcome: Outcome,
        field: &'static str,
        expected: Outcome,
    },

    #[error("item {item_id} cannot be a duplicate of itself")]
    SelfDuplicate { item_id: String },

    #[error("duplicate target {target} has no recorded decision")]
    DuplicateOfUnresolved { target: String },

    #[error("duplicate target {target} is itself a duplicate of {root}; point at {root} instead")]
    ChainedDuplicate { target: String, root: String },

    #[error("item {item_id} is {status:?}; it must be IN_REVIEW before a decision is recorded")]
    NotInReview { item_id: String, status: ItemStatus },

    #[error("commit {commit_ref} does not resolve in the local repository")]
    UnknownCommit { commit_ref: String },
}

/// Backend rejected a reply or minimize call. Retryable; the comment's
/// sync marker is only completed after confirmed success.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Collaboration backend unreachable: {message}")]
    Unreachable { message: String },

    #[error("Collaboration backend rejected {action} ({status}): {message}")]
    Rejected {
        action: &'static str,
        status: u16,
        message: String,
    },

    #[error("comment {comment_id} has no backend node id; cannot minimize")]
    MissingNodeId { comment_id: String },

    #[error("Not authenticated with GitHub; set GITHUB_TOKEN or run `sift auth --token`")]
    NotAuthenticated,
}

/// Persistence failures in the `.sift/` state directory.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no triage run found in {path}; run `sift init <pr>` first")]
    NotInitialized { path: String },

    #[error("a triage run already exists in {path}; pass --force to replace it")]
    AlreadyInitialized { path: String },

    #[error("record {path} already exists")]
    AlreadyExists { path: String },

    #[error("record {path} not found")]
    Missing { path: String },

    #[error("timed out waiting for state lock ({secs}s)")]
    LockTimeout { secs: u64 },

    #[error("corrupt record {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("state I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Umbrella error surfaced by engine operations.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no unresolved items remain; run `sift status` or `sift sync`")]
    NoCurrentItem,
}

impl TriageError {
    /// Retryable conditions leave state untouched and can simply be re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriageError::Dispatch(_) | TriageError::Sync(_) | TriageError::Ingest(_)
        )
    }
}

pub type TriageResult<T> = Result<T, TriageError>;
