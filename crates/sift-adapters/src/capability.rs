//! Command-backed evaluator and fixer capabilities.
//!
//! Each capability is an external program. It receives the bundle path in
//! `SIFT_BUNDLE` and must write a tagged result envelope to `SIFT_RESULT`
//! before exiting zero. The result is validated here; the program never
//! touches triage state itself.

use crate::config::{Config, EVALUATOR_CMD_ENV, FIXER_CMD_ENV};
use crate::store::StateStore;
use crate::util::run_command_with_timeout;
use serde::de::DeserializeOwned;
use sift_core::util::truncate;
use sift_core::{
    BundleKind, BundleRef, CapabilityResult, DispatchError, Evaluator, FixReport, Fixer,
    ProjectConfig, Recommendation,
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const EVALUATOR: &str = "evaluator";
const FIXER: &str = "fixer";
const MAX_DETAIL_CHARS: usize = 300;

/// argv plus the bounds it runs under.
#[derive(Debug, Clone)]
pub struct CapabilityCommand {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub working_dir: PathBuf,
}

pub struct CommandEvaluator {
    command: CapabilityCommand,
    store: StateStore,
}

impl CommandEvaluator {
    pub fn new(command: CapabilityCommand, store: StateStore) -> Self {
        Self { command, store }
    }

    pub fn from_config(config: &Config, store: StateStore) -> Self {
        let command = CapabilityCommand {
            argv: config.evaluator_command.clone(),
            timeout: config.capability_timeout(),
            working_dir: store.repo_root().to_path_buf(),
        };
        Self::new(command, store)
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, bundle: &BundleRef) -> Result<Recommendation, DispatchError> {
        let result_path = self.store.result_path(&bundle.item_id, BundleKind::Evaluate);
        let recommendation: Recommendation = dispatch(
            EVALUATOR,
            EVALUATOR_CMD_ENV,
            &self.command,
            bundle,
            &result_path,
            &[],
        )?;
        recommendation
            .validate()
            .map_err(|message| DispatchError::Malformed {
                capability: EVALUATOR,
                message,
            })?;
        Ok(recommendation)
    }
}

pub struct CommandFixer {
    command: CapabilityCommand,
    store: StateStore,
}

impl CommandFixer {
    pub fn new(command: CapabilityCommand, store: StateStore) -> Self {
        Self { command, store }
    }

    pub fn from_config(config: &Config, store: StateStore) -> Self {
        let command = CapabilityCommand {
            argv: config.fixer_command.clone(),
            timeout: config.capability_timeout(),
            working_dir: store.repo_root().to_path_buf(),
        };
        Self::new(command, store)
    }
}

impl Fixer for CommandFixer {
    fn fix(&self, bundle: &BundleRef) -> Result<FixReport, DispatchError> {
        let project = self
            .store
            .load_project_config()
            .map_err(|e| DispatchError::Unavailable {
                capability: FIXER,
                message: format!("could not load project config: {}", e),
            })?;
        let result_path = self.store.result_path(&bundle.item_id, BundleKind::Fix);
        dispatch(
            FIXER,
            FIXER_CMD_ENV,
            &self.command,
            bundle,
            &result_path,
            &project_env(&project),
        )
    }
}

fn project_env(project: &ProjectConfig) -> Vec<(&'static str, String)> {
    [
        ("SIFT_BUILD_CMD", &project.build_command),
        ("SIFT_TEST_CMD", &project.test_command),
        ("SIFT_LINT_CMD", &project.lint_command),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.clone().map(|v| (name, v)))
    .collect()
}

fn dispatch<T: DeserializeOwned>(
    capability: &'static str,
    env_var: &'static str,
    command: &CapabilityCommand,
    bundle: &BundleRef,
    result_path: &Path,
    extra_env: &[(&'static str, String)],
) -> Result<T, DispatchError> {
    let Some((program, args)) = command.argv.split_first() else {
        return Err(DispatchError::NotConfigured {
            capability,
            env_var,
        });
    };

    let unavailable = |message: String| DispatchError::Unavailable {
        capability,
        message,
    };

    // A result left over from an earlier attempt must never be mistaken
    // for this run's output.
    match fs::remove_file(result_path) {
        Ok(()) => tracing::debug!(path = %result_path.display(), "removed stale result"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(unavailable(format!("cannot clear stale result: {}", err))),
    }
    if let Some(parent) = result_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| unavailable(format!("cannot create result directory: {}", e)))?;
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&command.working_dir)
        .env("SIFT_BUNDLE", &bundle.path)
        .env("SIFT_RESULT", result_path)
        .env("SIFT_ITEM_ID", &bundle.item_id);
    for (name, value) in extra_env {
        cmd.env(name, value);
    }

    tracing::info!(
        capability,
        item = %bundle.item_id,
        program = %program,
        "dispatching capability"
    );
    let run = run_command_with_timeout(&mut cmd, command.timeout).map_err(unavailable)?;
    if run.timed_out {
        return Err(unavailable(format!(
            "timed out after {}s",
            command.timeout.as_secs()
        )));
    }
    if !run.succeeded() {
        let status = run
            .status
            .and_then(|s| s.code())
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(unavailable(format!(
            "exited with status {}: {}",
            status,
            truncate(&run.tail(), MAX_DETAIL_CHARS)
        )));
    }

    let raw = match fs::read_to_string(result_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(DispatchError::Malformed {
                capability,
                message: format!("no result written to {}", result_path.display()),
            })
        }
        Err(err) => return Err(unavailable(format!("cannot read result: {}", err))),
    };

    match parse_capability_result::<T>(&raw) {
        Ok(CapabilityResult::Ok { payload }) => Ok(payload),
        Ok(CapabilityResult::Failed { reason }) => Err(DispatchError::Failed {
            capability,
            reason: truncate(reason.trim(), MAX_DETAIL_CHARS),
        }),
        Err(message) => Err(DispatchError::Malformed {
            capability,
            message,
        }),
    }
}

/// Parse a result envelope. A surrounding markdown code fence is tolerated;
/// anything else that is not exactly the envelope is rejected.
pub fn parse_capability_result<T: DeserializeOwned>(
    raw: &str,
) -> Result<CapabilityResult<T>, String> {
    let clean = strip_markdown_fences(raw);
    if clean.is_empty() {
        return Err("result file is empty".to_string());
    }
    serde_json::from_str(clean).map_err(|e| {
        format!(
            "invalid result envelope ({}): {}",
            e,
            truncate(clean, MAX_DETAIL_CHARS / 3)
        )
    })
}

fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}
