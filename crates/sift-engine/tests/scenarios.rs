mod support;

use sift_adapters::store::StateStore;
use sift_core::{ItemStatus, MinimizeReason, Outcome, TriageError, ValidationError};
use sift_engine::{
    initialize_run, DecisionInput, InitOptions, StepOutcome, StepPolicy, SyncEngine,
};
use support::{orchestrator, pr, recommendation, review_comment, Call, RecordingBackend, ScriptedEvaluator};

async fn init(comments: Vec<sift_core::Comment>) -> (tempfile::TempDir, StateStore, RecordingBackend) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let backend = RecordingBackend::new(comments);
    initialize_run(&store, &backend, &pr(), &InitOptions::default())
        .await
        .unwrap();
    (dir, store, backend)
}

#[tokio::test]
async fn simple_fix_is_synced_exactly_once() {
    let (dir, store, backend) =
        init(vec![review_comment("501", "use async for this call", "src/x.py", 10, 0)]).await;
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/x.py"), "import requests\n".repeat(12)).unwrap();

    let items = store.load_items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].category, "async");

    let evaluator = ScriptedEvaluator::new(vec![(
        "501.1",
        recommendation(Outcome::Fixed, "blocking call inside the event loop"),
    )]);
    let seen = evaluator.seen.clone();
    let orchestrator = orchestrator(&store, evaluator);

    let report = orchestrator
        .step(&StepPolicy::default(), Some(&backend))
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        StepOutcome::Decided {
            outcome: Outcome::Fixed
        }
    );
    let bundle = seen.lock().unwrap()[0].clone();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&bundle.path).unwrap()).unwrap();
    assert_eq!(json["location"]["start_line"], 10);
    assert_eq!(json["source"]["first_line"], 2);

    let decision = store.load_decision("501.1").unwrap().unwrap();
    assert_eq!(decision.commit_ref.as_deref(), Some("abc123"));
    assert!(store.load_comment("501").unwrap().resolved);

    let sync = SyncEngine::new(&store, &backend);
    sync.run(false).await.unwrap();
    sync.run(false).await.unwrap();
    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], Call::Reply { comment_id, body } if comment_id == "501" && body.contains("abc123")));
    assert_eq!(
        calls[1],
        Call::Minimize {
            comment_id: "501".to_string(),
            reason: MinimizeReason::Resolved
        }
    );
}

#[tokio::test]
async fn duplicate_candidate_surfaces_and_chains_are_rejected() {
    let (_dir, store, _backend) = init(vec![
        review_comment("1", "missing null check on the session user", "src/a.py", 3, 0),
        review_comment("2", "missing null check for the session user", "src/b.py", 8, 1),
        review_comment("3", "missing null check on session user", "src/c.py", 2, 2),
    ])
    .await;
    let orchestrator = orchestrator(&store, ScriptedEvaluator::default());

    orchestrator.begin_evaluation().unwrap();
    orchestrator
        .decide(DecisionInput::new("1.1", Outcome::Fixed, "guarded").with_commit("abc123"))
        .unwrap();

    let bundle = orchestrator.begin_evaluation().unwrap();
    assert_eq!(bundle.item_id, "2.1");
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&bundle.path).unwrap()).unwrap();
    assert_eq!(json["duplicate_candidate"]["item_id"], "1.1");

    orchestrator
        .decide(DecisionInput::new("2.1", Outcome::Duplicate, "same guard").with_duplicate_of("1.1"))
        .unwrap();

    orchestrator.begin_evaluation().unwrap();
    let err = orchestrator
        .decide(DecisionInput::new("3.1", Outcome::Duplicate, "same").with_duplicate_of("2.1"))
        .unwrap_err();
    assert!(matches!(
        err,
        TriageError::Validation(ValidationError::ChainedDuplicate { .. })
    ));
    assert!(store.load_decision("3.1").unwrap().is_none());
    assert_eq!(store.load_run_state().unwrap().current_item_index, 2);
}

#[tokio::test]
async fn bundled_comment_yields_three_independent_items() {
    let body = "Three things here:\n\n* add a null check before dereferencing `user`\n* rename `tmp` to `buffer`\n* this loop allocates on every iteration\n";
    let (_dir, store, backend) = init(vec![review_comment("9", body, "src/x.py", 4, 0)]).await;
    let orchestrator = orchestrator(&store, ScriptedEvaluator::default());

    let mut briefed = Vec::new();
    let outcomes = [Outcome::Ignored, Outcome::Obsolete, Outcome::Ignored];
    for outcome in outcomes {
        let line = orchestrator.brief().unwrap().unwrap();
        briefed.push(line.item_id.clone());
        assert!(!store.load_comment("9").unwrap().resolved);
        orchestrator.begin_evaluation().unwrap();
        orchestrator
            .decide(DecisionInput::new(line.item_id.as_str(), outcome, "triaged"))
            .unwrap();
    }
    assert_eq!(briefed, vec!["9.1", "9.2", "9.3"]);
    assert!(store.load_comment("9").unwrap().resolved);

    SyncEngine::new(&store, &backend).run(false).await.unwrap();
    let calls = backend.calls();
    // Mixed outcomes consolidate to RESOLVED; one reply covers all three.
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], Call::Reply { body, .. } if body.starts_with("Resolved 3 points")));
    assert!(matches!(
        &calls[1],
        Call::Minimize {
            reason: MinimizeReason::Resolved,
            ..
        }
    ));
}

#[tokio::test]
async fn interrupted_run_resumes_without_reprocessing() {
    let (_dir, store, _backend) = init(vec![
        review_comment("1", "rename tmp", "a.py", 1, 0),
        review_comment("2", "handle the error from open()", "a.py", 5, 1),
        review_comment("3", "add a test for the empty list", "a.py", 9, 2),
    ])
    .await;
    let evaluator = ScriptedEvaluator::new(vec![
        ("1.1", recommendation(Outcome::Ignored, "naming is fine")),
        ("2.1", recommendation(Outcome::Obsolete, "open() call was removed")),
        ("3.1", recommendation(Outcome::Ignored, "covered elsewhere")),
    ]);
    let seen = evaluator.seen.clone();

    {
        let first = orchestrator(&store, evaluator.clone());
        first.step(&StepPolicy::default(), None).await.unwrap();
        let before = store.load_run_state().unwrap();
        first.advance().unwrap();
        assert_eq!(store.load_run_state().unwrap(), before);
    }

    let resumed = orchestrator(&store, evaluator);
    assert_eq!(resumed.brief().unwrap().unwrap().item_id, "2.1");
    while let StepOutcome::Decided { .. } = resumed
        .step(&StepPolicy::default(), None)
        .await
        .unwrap()
        .outcome
    {}

    let evaluated: Vec<String> = seen.lock().unwrap().iter().map(|b| b.item_id.clone()).collect();
    assert_eq!(evaluated, vec!["1.1", "2.1", "3.1"]);
    let status = resumed.status().unwrap();
    assert_eq!((status.resolved, status.total), (3, 3));
}

#[tokio::test]
async fn resolved_items_are_immutable() {
    let (_dir, store, _backend) = init(vec![review_comment("1", "rename tmp", "a.py", 1, 0)]).await;
    let orchestrator = orchestrator(&store, ScriptedEvaluator::default());
    orchestrator.begin_evaluation().unwrap();
    orchestrator
        .decide(DecisionInput::new("1.1", Outcome::Ignored, "keep the name"))
        .unwrap();
    let path = store.state_dir().join("decisions").join("1.1.json");
    let original = std::fs::read_to_string(&path).unwrap();

    let err = orchestrator
        .decide(DecisionInput::new("1.1", Outcome::Fixed, "renamed after all").with_commit("abc123"))
        .unwrap_err();
    assert!(matches!(
        err,
        TriageError::Validation(ValidationError::AlreadyResolved { .. })
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    assert_eq!(
        store.load_item("1.1").unwrap().unwrap().status,
        ItemStatus::Resolved
    );
}
