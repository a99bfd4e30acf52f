//! `init`: fetch, decompose, persist.

use chrono::{DateTime, Utc};
use sift_adapters::project::{resolve_project_config, ProjectOverrides};
use sift_adapters::store::{InitSnapshot, StateStore};
use sift_core::decompose::items_for_comment;
use sift_core::{
    CollaborationBackend, Comment, ProjectConfig, PullRequestRef, RunState, StoreError,
    TriageResult,
};

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Replace an existing run.
    pub force: bool,
    pub overrides: ProjectOverrides,
}

#[derive(Debug, Clone)]
pub struct InitSummary {
    pub pr: PullRequestRef,
    pub comments: usize,
    pub items: usize,
    pub project: ProjectConfig,
}

/// Order comments, decompose each into items and number the items in the
/// processing order: comment creation time, then comment id, then
/// extraction order.
pub fn build_snapshot(
    pr: &PullRequestRef,
    mut comments: Vec<Comment>,
    project: ProjectConfig,
    now: DateTime<Utc>,
) -> InitSnapshot {
    comments.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    comments.dedup_by(|a, b| a.id == b.id);

    let mut items = Vec::new();
    for comment in comments.iter_mut() {
        comment.resolved = false;
        let extracted = items_for_comment(comment, items.len());
        tracing::debug!(comment = %comment.id, items = extracted.len(), "decomposed comment");
        items.extend(extracted);
    }

    InitSnapshot {
        run: RunState {
            pr: pr.clone(),
            current_item_index: 0,
            total_items: items.len(),
            initialized_at: now,
        },
        project,
        comments,
        items,
    }
}

/// Start a triage run for `pr`. Nothing is written until every comment has
/// been fetched, and the run state is written last.
pub async fn initialize_run(
    store: &StateStore,
    backend: &dyn CollaborationBackend,
    pr: &PullRequestRef,
    options: &InitOptions,
) -> TriageResult<InitSummary> {
    if store.is_initialized() && !options.force {
        return Err(StoreError::AlreadyInitialized {
            path: store.state_dir().display().to_string(),
        }
        .into());
    }

    let comments = backend.fetch_comments(pr).await?;
    let project = resolve_project_config(store.repo_root(), &options.overrides);
    if let Some(source) = &project.detected_from {
        tracing::info!(detected_from = %source, "project tooling resolved");
    }

    let snapshot = build_snapshot(pr, comments, project, Utc::now());
    store.initialize(&snapshot, options.force)?;

    Ok(InitSummary {
        pr: pr.clone(),
        comments: snapshot.comments.len(),
        items: snapshot.items.len(),
        project: snapshot.project,
    })
}
