use super::*;
use chrono::TimeZone;
use sift_core::{Location, Outcome, PullRequestRef, ThreadKind};
use tempfile::TempDir;

fn pr() -> PullRequestRef {
    PullRequestRef {
        owner: "acme".to_string(),
        repo: "widgets".to_string(),
        number: 7,
    }
}

fn comment(id: &str, minute: u32) -> Comment {
    Comment {
        id: id.to_string(),
        node_id: Some(format!("NODE_{}", id)),
        location: Some(Location::new("src/x.py", Some(10), None)),
        author: "reviewer".to_string(),
        body: "use async for this call".to_string(),
        thread_kind: ThreadKind::ReviewComment,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
        resolved: false,
    }
}

fn item(comment_id: &str, n: usize, sequence: usize) -> Item {
    Item {
        id: Item::make_id(comment_id, n),
        parent_comment_id: comment_id.to_string(),
        sequence,
        summary: format!("request {}", n + 1),
        category: "general".to_string(),
        location: None,
        status: ItemStatus::Pending,
    }
}

fn decision(item_id: &str, revision: u32) -> Decision {
    Decision {
        item_id: item_id.to_string(),
        outcome: Outcome::Ignored,
        reasoning: "not applicable".to_string(),
        commit_ref: None,
        duplicate_of: None,
        linked_issue: None,
        decided_at: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        revision,
    }
}

fn snapshot() -> InitSnapshot {
    InitSnapshot {
        run: RunState {
            pr: pr(),
            current_item_index: 0,
            total_items: 3,
            initialized_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        },
        project: ProjectConfig {
            build_command: Some("cargo check".to_string()),
            test_command: Some("cargo test".to_string()),
            lint_command: None,
            detected_from: Some("cargo".to_string()),
        },
        comments: vec![comment("200", 5), comment("100", 1)],
        items: vec![item("200", 0, 1), item("100", 0, 0), item("200", 1, 2)],
    }
}

fn initialized() -> (TempDir, StateStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    store.initialize(&snapshot(), false).unwrap();
    (dir, store)
}

#[test]
fn reads_before_init_report_not_initialized() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    assert!(!store.is_initialized());
    assert!(matches!(
        store.load_run_state(),
        Err(StoreError::NotInitialized { .. })
    ));
}

#[test]
fn initialize_persists_everything_in_order() {
    let (_dir, store) = initialized();
    assert!(store.is_initialized());

    let run = store.load_run_state().unwrap();
    assert_eq!(run.total_items, 3);
    assert_eq!(run.pr, pr());

    let items = store.load_items().unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["100.1", "200.1", "200.2"]);
    assert_eq!(store.item_id_at(1).unwrap().as_deref(), Some("200.1"));
    assert_eq!(store.item_id_at(3).unwrap(), None);

    let comments = store.load_comments().unwrap();
    assert_eq!(comments[0].id, "100");

    let project = store.load_project_config().unwrap();
    assert_eq!(project.test_command.as_deref(), Some("cargo test"));
}

#[test]
fn initialize_refuses_to_replace_without_force() {
    let (_dir, store) = initialized();
    assert!(matches!(
        store.initialize(&snapshot(), false),
        Err(StoreError::AlreadyInitialized { .. })
    ));

    store.insert_decision(&decision("100.1", 1)).unwrap();
    store.initialize(&snapshot(), true).unwrap();
    assert!(store.load_decision("100.1").unwrap().is_none());
}

#[test]
fn state_dir_is_git_ignored() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join(".git")).unwrap();
    let store = StateStore::new(dir.path());
    store.initialize(&snapshot(), false).unwrap();
    let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
    assert!(exclude.lines().any(|l| l.trim() == ".sift/"));

    // A second write does not duplicate the entry.
    store.save_run_state(&snapshot().run).unwrap();
    let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
    assert_eq!(exclude.matches(".sift/").count(), 1);
}

#[test]
fn decisions_are_write_once() {
    let (_dir, store) = initialized();
    store.insert_decision(&decision("100.1", 1)).unwrap();

    let mut changed = decision("100.1", 1);
    changed.reasoning = "edited".to_string();
    assert!(matches!(
        store.insert_decision(&changed),
        Err(StoreError::AlreadyExists { .. })
    ));
    assert_eq!(
        store.load_decision("100.1").unwrap().unwrap().reasoning,
        "not applicable"
    );
}

#[test]
fn superseding_revision_is_stored_alongside() {
    let (dir, store) = initialized();
    store.insert_decision(&decision("100.1", 1)).unwrap();
    let mut second = decision("100.1", 2);
    second.outcome = Outcome::Obsolete;
    store.insert_decision(&second).unwrap();

    assert!(dir.path().join(".sift/decisions/100.1.json").is_file());
    assert!(dir.path().join(".sift/decisions/100.1.r2.json").is_file());
    assert_eq!(
        store.load_decision("100.1").unwrap().unwrap().outcome,
        Outcome::Obsolete
    );
    let all = store.load_decisions().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].revision, 2);
}

#[test]
fn items_for_comment_do_not_leak_across_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let mut snap = snapshot();
    snap.comments.push(comment("2000", 9));
    snap.items.push(item("2000", 0, 3));
    snap.run.total_items = 4;
    store.initialize(&snap, false).unwrap();

    let items = store.load_items_for_comment("200").unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["200.1", "200.2"]);
}

#[test]
fn bundle_and_result_paths_are_per_item() {
    let (dir, store) = initialized();
    let bundle = store
        .write_bundle("100.1", BundleKind::Evaluate, &serde_json::json!({"a": 1}))
        .unwrap();
    assert_eq!(
        bundle.path,
        dir.path().join(".sift/bundles/100.1/evaluate.json")
    );
    assert!(bundle.path.is_file());

    // Regenerating overwrites in place.
    let again = store
        .write_bundle("100.1", BundleKind::Evaluate, &serde_json::json!({"a": 2}))
        .unwrap();
    assert_eq!(again.path, bundle.path);
    let content: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&again.path).unwrap()).unwrap();
    assert_eq!(content["a"], 2);

    assert_eq!(
        store.result_path("100.1", BundleKind::Fix),
        dir.path().join(".sift/results/100.1/fix.json")
    );
}

#[test]
fn hostile_ids_stay_inside_state_dir() {
    let (dir, store) = initialized();
    let path = store.bundle_path("../../etc/passwd", BundleKind::Fix);
    assert!(path.starts_with(dir.path().join(".sift/bundles")));
    assert_eq!(file_stem_for(".."), "_..");
}

#[test]
fn sync_marker_round_trip() {
    let (_dir, store) = initialized();
    assert!(store.load_sync_marker("100").unwrap().is_none());
    let mut marker = SyncMarker::new("100", MinimizeReason::Resolved);
    marker.reply_id = Some("555".to_string());
    store.save_sync_marker(&marker).unwrap();
    let loaded = store.load_sync_marker("100").unwrap().unwrap();
    assert_eq!(loaded.reply_id.as_deref(), Some("555"));
    assert!(!loaded.is_complete());
}

#[test]
fn reconcile_repairs_interrupted_decision_write() {
    let (_dir, store) = initialized();
    // Decision landed but the item flip and comment recompute did not.
    store.insert_decision(&decision("100.1", 1)).unwrap();

    let report = store.reconcile().unwrap();
    assert_eq!(report.items_repaired, vec!["100.1".to_string()]);
    assert_eq!(report.comments_updated, vec!["100".to_string()]);
    assert_eq!(
        store.load_item("100.1").unwrap().unwrap().status,
        ItemStatus::Resolved
    );
    assert!(store.load_comment("100").unwrap().resolved);
    assert!(!store.load_comment("200").unwrap().resolved);

    assert!(store.reconcile().unwrap().is_clean());
}

#[test]
fn corrupt_records_are_reported() {
    let (dir, store) = initialized();
    fs::write(dir.path().join(".sift/items/100.1.json"), "{not json").unwrap();
    assert!(matches!(
        store.load_item("100.1"),
        Err(StoreError::Corrupt { .. })
    ));
}
