//! File-backed state store for a triage run.
//!
//! Everything lives under `<repo>/.sift/` as pretty-printed JSON so a human
//! can audit it with `cat`. Writes take an exclusive advisory lock and go
//! through a temp-file + rename; reads take a shared lock.
//!
//! Decision records are write-once: `insert_decision` refuses to replace an
//! existing file, and superseding records are stored under a new revision.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sift_core::error::StoreError;
use sift_core::{
    BundleKind, BundleRef, Comment, Decision, Item, ItemStatus, MinimizeReason, ProjectConfig,
    RunState,
};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const STATE_DIR: &str = ".sift";
const RUN_FILE: &str = "run.json";
const PROJECT_FILE: &str = "project.json";
const ORDER_FILE: &str = "order.json";
const COMMENTS_DIR: &str = "comments";
const ITEMS_DIR: &str = "items";
const DECISIONS_DIR: &str = "decisions";
const BUNDLES_DIR: &str = "bundles";
const RESULTS_DIR: &str = "results";
const SYNC_DIR: &str = "sync";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// Per-comment record of what has been pushed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub comment_id: String,
    pub reason: MinimizeReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimized_at: Option<DateTime<Utc>>,
}

impl SyncMarker {
    pub fn new(comment_id: impl Into<String>, reason: MinimizeReason) -> Self {
        Self {
            comment_id: comment_id.into(),
            reason,
            reply_id: None,
            replied_at: None,
            minimized_at: None,
        }
    }

    /// Synced only once both the reply and the minimize went through.
    pub fn is_complete(&self) -> bool {
        self.reply_id.is_some() && self.minimized_at.is_some()
    }
}

/// Everything `init` persists, written in one go with the run state last.
#[derive(Debug, Clone)]
pub struct InitSnapshot {
    pub run: RunState,
    pub project: ProjectConfig,
    pub comments: Vec<Comment>,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Items flipped to RESOLVED because a decision was already on disk.
    pub items_repaired: Vec<String>,
    /// Comments whose `resolved` flag changed.
    pub comments_updated: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.items_repaired.is_empty() && self.comments_updated.is_empty()
    }
}

/// The `.sift/` state directory of one repository.
#[derive(Debug, Clone)]
pub struct StateStore {
    repo_root: PathBuf,
    state_dir: PathBuf,
}

struct StateLock {
    file: fs::File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            state_dir: repo_root.join(STATE_DIR),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.join(RUN_FILE).is_file()
    }

    // ── Initialisation ──────────────────────────────────────────────────

    /// Persist a fresh run. Refuses to replace an existing run unless
    /// `force` is set, in which case all previous records are removed.
    pub fn initialize(&self, snapshot: &InitSnapshot, force: bool) -> Result<(), StoreError> {
        let _lock = self.lock(true)?;

        if self.is_initialized() && !force {
            return Err(StoreError::AlreadyInitialized {
                path: self.state_dir.display().to_string(),
            });
        }

        for dir in [
            COMMENTS_DIR,
            ITEMS_DIR,
            DECISIONS_DIR,
            BUNDLES_DIR,
            RESULTS_DIR,
            SYNC_DIR,
        ] {
            let path = self.state_dir.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }
        // The run file goes first on a forced re-init so a crash mid-way
        // leaves the store un-initialised rather than half old, half new.
        remove_if_exists(&self.state_dir.join(RUN_FILE))?;

        write_json(&self.state_dir.join(PROJECT_FILE), &snapshot.project)?;
        for comment in &snapshot.comments {
            write_json(&self.comment_path(&comment.id), comment)?;
        }
        let mut order: Vec<&Item> = snapshot.items.iter().collect();
        order.sort_by_key(|item| item.sequence);
        for item in &order {
            write_json(&self.item_path(&item.id), item)?;
        }
        let ids: Vec<&str> = order.iter().map(|item| item.id.as_str()).collect();
        write_json(&self.state_dir.join(ORDER_FILE), &ids)?;

        write_json(&self.state_dir.join(RUN_FILE), &snapshot.run)?;
        tracing::info!(
            pr = %snapshot.run.pr,
            comments = snapshot.comments.len(),
            items = snapshot.items.len(),
            "initialized triage run"
        );
        Ok(())
    }

    // ── Run state & project config ──────────────────────────────────────

    pub fn load_run_state(&self) -> Result<RunState, StoreError> {
        let _lock = self.lock(false)?;
        let path = self.state_dir.join(RUN_FILE);
        read_json(&path)?.ok_or_else(|| self.not_initialized())
    }

    pub fn save_run_state(&self, run: &RunState) -> Result<(), StoreError> {
        let _lock = self.lock(true)?;
        write_json(&self.state_dir.join(RUN_FILE), run)
    }

    /// Missing project config means nothing was detected.
    pub fn load_project_config(&self) -> Result<ProjectConfig, StoreError> {
        let _lock = self.lock(false)?;
        Ok(read_json(&self.state_dir.join(PROJECT_FILE))?.unwrap_or_default())
    }

    // ── Comments ────────────────────────────────────────────────────────

    pub fn load_comment(&self, comment_id: &str) -> Result<Comment, StoreError> {
        let _lock = self.lock(false)?;
        let path = self.comment_path(comment_id);
        read_json(&path)?.ok_or_else(|| missing(&path))
    }

    pub fn save_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let _lock = self.lock(true)?;
        write_json(&self.comment_path(&comment.id), comment)
    }

    /// All comments ordered by creation time, then id.
    pub fn load_comments(&self) -> Result<Vec<Comment>, StoreError> {
        let _lock = self.lock(false)?;
        let mut comments: Vec<Comment> = read_dir_json(&self.state_dir.join(COMMENTS_DIR))?;
        comments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(comments)
    }

    // ── Items ───────────────────────────────────────────────────────────

    pub fn load_item(&self, item_id: &str) -> Result<Option<Item>, StoreError> {
        let _lock = self.lock(false)?;
        read_json(&self.item_path(item_id))
    }

    pub fn save_item(&self, item: &Item) -> Result<(), StoreError> {
        let _lock = self.lock(true)?;
        write_json(&self.item_path(&item.id), item)
    }

    /// All items in processing order.
    pub fn load_items(&self) -> Result<Vec<Item>, StoreError> {
        let _lock = self.lock(false)?;
        let mut items: Vec<Item> = read_dir_json(&self.state_dir.join(ITEMS_DIR))?;
        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }

    /// The id of the item at position `index` of the processing order.
    pub fn item_id_at(&self, index: usize) -> Result<Option<String>, StoreError> {
        let _lock = self.lock(false)?;
        let order: Vec<String> =
            read_json(&self.state_dir.join(ORDER_FILE))?.ok_or_else(|| self.not_initialized())?;
        Ok(order.into_iter().nth(index))
    }

    /// Items extracted from one comment, by extraction order.
    pub fn load_items_for_comment(&self, comment_id: &str) -> Result<Vec<Item>, StoreError> {
        let _lock = self.lock(false)?;
        let dir = self.state_dir.join(ITEMS_DIR);
        let prefix = format!("{}.", file_stem_for(comment_id));
        let mut items = Vec::new();
        for path in json_files(&dir)? {
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix));
            if !matches {
                continue;
            }
            if let Some(item) = read_json::<Item>(&path)? {
                if item.parent_comment_id == comment_id {
                    items.push(item);
                }
            }
        }
        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }

    // ── Decisions ───────────────────────────────────────────────────────

    /// The latest revision of an item's decision, if any.
    pub fn load_decision(&self, item_id: &str) -> Result<Option<Decision>, StoreError> {
        let _lock = self.lock(false)?;
        self.load_decision_unlocked(item_id)
    }

    /// Write a decision record. Never replaces an existing record.
    pub fn insert_decision(&self, decision: &Decision) -> Result<PathBuf, StoreError> {
        let _lock = self.lock(true)?;
        let path = self.decision_path(&decision.item_id, decision.revision);
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        write_json(&path, decision)?;
        tracing::info!(
            item = %decision.item_id,
            outcome = %decision.outcome,
            revision = decision.revision,
            "decision recorded"
        );
        Ok(path)
    }

    /// Latest revision per item.
    pub fn load_decisions(&self) -> Result<Vec<Decision>, StoreError> {
        let _lock = self.lock(false)?;
        let all: Vec<Decision> = read_dir_json(&self.state_dir.join(DECISIONS_DIR))?;
        let mut latest: HashMap<String, Decision> = HashMap::new();
        for decision in all {
            let keep = latest
                .get(&decision.item_id)
                .is_none_or(|current| decision.revision > current.revision);
            if keep {
                latest.insert(decision.item_id.clone(), decision);
            }
        }
        let mut decisions: Vec<Decision> = latest.into_values().collect();
        decisions.sort_by(|a, b| {
            a.decided_at
                .cmp(&b.decided_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        Ok(decisions)
    }

    // ── Bundles & capability results ────────────────────────────────────

    pub fn bundle_path(&self, item_id: &str, kind: BundleKind) -> PathBuf {
        self.state_dir
            .join(BUNDLES_DIR)
            .join(file_stem_for(item_id))
            .join(format!("{}.json", kind.file_stem()))
    }

    /// Materialise a bundle, replacing any previous one for the same item.
    pub fn write_bundle<T: Serialize>(
        &self,
        item_id: &str,
        kind: BundleKind,
        bundle: &T,
    ) -> Result<BundleRef, StoreError> {
        let _lock = self.lock(true)?;
        let path = self.bundle_path(item_id, kind);
        write_json(&path, bundle)?;
        tracing::debug!(item = item_id, kind = kind.file_stem(), path = %path.display(), "bundle written");
        Ok(BundleRef {
            item_id: item_id.to_string(),
            kind,
            path,
        })
    }

    /// Where a capability must write its result for a bundle.
    pub fn result_path(&self, item_id: &str, kind: BundleKind) -> PathBuf {
        let file = match kind {
            BundleKind::Evaluate => "evaluation.json",
            BundleKind::Fix => "fix.json",
        };
        self.state_dir
            .join(RESULTS_DIR)
            .join(file_stem_for(item_id))
            .join(file)
    }

    // ── Sync markers ────────────────────────────────────────────────────

    pub fn load_sync_marker(&self, comment_id: &str) -> Result<Option<SyncMarker>, StoreError> {
        let _lock = self.lock(false)?;
        read_json(&self.sync_path(comment_id))
    }

    pub fn save_sync_marker(&self, marker: &SyncMarker) -> Result<(), StoreError> {
        let _lock = self.lock(true)?;
        write_json(&self.sync_path(&marker.comment_id), marker)
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    /// Repair state left behind by an interrupted decision write: items with
    /// a decision on disk become RESOLVED, and every comment's `resolved`
    /// flag is recomputed from its items.
    pub fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let _lock = self.lock(true)?;
        if !self.is_initialized() {
            return Err(self.not_initialized());
        }

        let mut report = ReconcileReport::default();
        let mut items: Vec<Item> = read_dir_json(&self.state_dir.join(ITEMS_DIR))?;
        for item in items.iter_mut() {
            if item.status == ItemStatus::Resolved {
                continue;
            }
            if self.load_decision_unlocked(&item.id)?.is_some() {
                tracing::warn!(item = %item.id, "decision on disk but item not resolved; repairing");
                item.status = ItemStatus::Resolved;
                write_json(&self.item_path(&item.id), item)?;
                report.items_repaired.push(item.id.clone());
            }
        }

        let mut all_resolved: HashMap<&str, bool> = HashMap::new();
        for item in &items {
            let entry = all_resolved
                .entry(item.parent_comment_id.as_str())
                .or_insert(true);
            *entry &= item.status == ItemStatus::Resolved;
        }

        let comments: Vec<Comment> = read_dir_json(&self.state_dir.join(COMMENTS_DIR))?;
        for mut comment in comments {
            let resolved = all_resolved
                .get(comment.id.as_str())
                .copied()
                .unwrap_or(false);
            if comment.resolved != resolved {
                comment.resolved = resolved;
                write_json(&self.comment_path(&comment.id), &comment)?;
                report.comments_updated.push(comment.id.clone());
            }
        }

        report.items_repaired.sort();
        report.comments_updated.sort();
        Ok(report)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn load_decision_unlocked(&self, item_id: &str) -> Result<Option<Decision>, StoreError> {
        let mut latest: Option<Decision> = read_json(&self.decision_path(item_id, 1))?;
        if latest.is_none() {
            return Ok(None);
        }
        let mut revision = 2;
        while let Some(next) = read_json::<Decision>(&self.decision_path(item_id, revision))? {
            latest = Some(next);
            revision += 1;
        }
        Ok(latest)
    }

    fn comment_path(&self, comment_id: &str) -> PathBuf {
        self.state_dir
            .join(COMMENTS_DIR)
            .join(format!("{}.json", file_stem_for(comment_id)))
    }

    fn item_path(&self, item_id: &str) -> PathBuf {
        self.state_dir
            .join(ITEMS_DIR)
            .join(format!("{}.json", file_stem_for(item_id)))
    }

    fn decision_path(&self, item_id: &str, revision: u32) -> PathBuf {
        let stem = file_stem_for(item_id);
        let name = if revision <= 1 {
            format!("{}.json", stem)
        } else {
            format!("{}.r{}.json", stem, revision)
        };
        self.state_dir.join(DECISIONS_DIR).join(name)
    }

    fn sync_path(&self, comment_id: &str) -> PathBuf {
        self.state_dir
            .join(SYNC_DIR)
            .join(format!("{}.json", file_stem_for(comment_id)))
    }

    fn not_initialized(&self) -> StoreError {
        StoreError::NotInitialized {
            path: self.state_dir.display().to_string(),
        }
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir).map_err(|e| StoreError::io(&self.state_dir, e))?;
        }
        self.ensure_state_ignored()
    }

    fn ensure_state_ignored(&self) -> Result<(), StoreError> {
        let gitignore_path = self.repo_root.join(".gitignore");
        if gitignore_path.exists() {
            return append_ignore_entry(&gitignore_path, ".sift/");
        }

        let git_dir = self.repo_root.join(".git");
        if git_dir.is_dir() {
            let info_exclude_path = git_dir.join("info").join("exclude");
            if let Some(parent) = info_exclude_path.parent() {
                let ready = fs::create_dir_all(parent).is_ok();
                if ready && append_ignore_entry(&info_exclude_path, ".sift/").is_ok() {
                    return Ok(());
                }
            }
        }

        append_ignore_entry(&gitignore_path, ".sift/")
    }

    fn lock(&self, exclusive: bool) -> Result<StateLock, StoreError> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.state_dir.exists() {
            return Err(self.not_initialized());
        }

        let lock_path = self.state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(StoreError::io(&lock_path, err));
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(StoreError::LockTimeout {
                            secs: LOCK_TIMEOUT_SECS,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(StateLock { file })
    }
}

/// Ids become file names; anything outside a conservative charset is
/// replaced so a hostile id cannot escape the state directory.
fn file_stem_for(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|ch| ch == '.') {
        format!("_{}", stem)
    } else {
        stem
    }
}

fn missing(path: &Path) -> StoreError {
    StoreError::Missing {
        path: path.display().to_string(),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    write_atomic(path, &content).map_err(|e| StoreError::io(path, e))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut records = Vec::new();
    for path in json_files(dir)? {
        if let Some(record) = read_json(&path)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn append_ignore_entry(path: &Path, entry: &str) -> Result<(), StoreError> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == STATE_DIR
    });
    if already_present {
        return Ok(());
    }

    use std::io::Write;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    let mut block = String::new();
    if !content.trim().is_empty() && !content.ends_with('\n') {
        block.push('\n');
    }
    block.push_str("# sift triage state\n");
    block.push_str(entry);
    block.push('\n');
    file.write_all(block.as_bytes())
        .map_err(|e| StoreError::io(path, e))
}

/// Temp file + rename. On Windows the destination is moved aside first
/// since rename does not replace there.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("json.bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
