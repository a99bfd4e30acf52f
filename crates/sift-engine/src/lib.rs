//! Triage engine for sift: context bundles, decisions, the item state
//! machine, ingestion and upstream sync.

pub mod context;
pub mod ingest;
pub mod orchestrator;
pub mod recorder;
pub mod sync;

#[cfg(test)]
mod testing;

pub use context::ContextAssembler;
pub use ingest::{build_snapshot, initialize_run, InitOptions, InitSummary};
pub use orchestrator::{Orchestrator, StatusCounts, StepOutcome, StepPolicy, StepReport};
pub use recorder::{CommitVerifier, DecisionInput, DecisionRecorder, GitCommitVerifier};
pub use sync::{SyncAction, SyncEngine, SyncReport};
