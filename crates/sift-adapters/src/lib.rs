//! Runtime adapters for sift (state store, GitHub, git, capabilities, config/auth).

pub mod capability;
pub mod config;
pub mod git_ops;
pub mod github;
pub mod keyring;
pub mod project;
pub mod store;
pub mod util;

pub use capability::{CapabilityCommand, CommandEvaluator, CommandFixer};
pub use config::Config;
pub use github::GitHubClient;
pub use store::{InitSnapshot, ReconcileReport, StateStore, SyncMarker};
