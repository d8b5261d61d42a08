use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use vaultflow::audit::{AuditLog, AuditQuery};
use vaultflow::bus::{EventBus, EventType};
use vaultflow::vault::{VaultPaths, PLAN_SUFFIX};
use vaultflow::workflow::{
    CorrelationTracker, RetryPolicy, TransitionRequest, WorkflowEngine, WorkflowState,
};

fn fixture(root: &std::path::Path) -> (VaultPaths, Arc<EventBus>, Arc<AuditLog>, Arc<WorkflowEngine>) {
    let vault = VaultPaths::new(root.join("vault"));
    vault.initialize().expect("init vault");
    let audit = Arc::new(
        AuditLog::open(
            &vault.audit_dir().join("immutable_audit.jsonl"),
            &vault.integrity_dir(),
        )
        .expect("open audit"),
    );
    let bus = Arc::new(EventBus::new(&vault.root, 256, 256));
    let tracker = Arc::new(CorrelationTracker::new());
    let engine = Arc::new(WorkflowEngine::new(
        vault.clone(),
        Arc::clone(&bus),
        Arc::clone(&audit),
        tracker,
        RetryPolicy {
            base_ms: 1,
            cap_ms: 10,
            max_attempts: 3,
        },
        500,
        300_000,
    ));
    (vault, bus, audit, engine)
}

fn seed_plan(vault: &VaultPaths, folder: &str, stem: &str) {
    fs::write(
        vault.file_in(folder, stem, PLAN_SUFFIX),
        b"---\nid: x\n---\n",
    )
    .expect("seed plan");
}

#[test]
fn valid_transition_moves_file_and_audits_and_publishes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, bus, audit, engine) = fixture(dir.path());
    let stem = "a1b2c3";
    seed_plan(&vault, "Plans", stem);
    let corr = engine.tracker().create_context(stem, WorkflowState::Plans);

    let req = TransitionRequest::new(
        stem,
        PLAN_SUFFIX,
        WorkflowState::Plans,
        WorkflowState::PendingApproval,
        &corr,
    );
    let outcome = engine.transition(&req).expect("transition");

    assert!(outcome.moved);
    assert!(!vault.file_in("Plans", stem, PLAN_SUFFIX).exists());
    assert!(vault.file_in("Pending_Approval", stem, PLAN_SUFFIX).exists());

    let completed = audit
        .query(&AuditQuery {
            event_type: Some("transition.completed".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(completed.len(), 1);

    let events: Vec<_> = bus
        .history(0, 32)
        .into_iter()
        .filter(|(_, e)| e.event_type == EventType::ApprovalRequired)
        .collect();
    assert_eq!(events.len(), 1);

    let context = engine.tracker().get(&corr).expect("context");
    assert_eq!(context.current_state, WorkflowState::PendingApproval);
}

#[test]
fn same_folder_states_transition_without_moving() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, _bus, _audit, engine) = fixture(dir.path());
    let stem = "b2c3d4";
    fs::write(
        vault.file_in("Needs_Action", stem, ".action.yaml"),
        b"id: x\n",
    )
    .expect("seed action");
    let corr = engine
        .tracker()
        .create_context(stem, WorkflowState::NeedsAction);

    let req = TransitionRequest::new(
        stem,
        ".action.yaml",
        WorkflowState::NeedsAction,
        WorkflowState::ActionProcessing,
        &corr,
    );
    let outcome = engine.transition(&req).expect("transition");
    assert!(!outcome.moved);
    assert!(vault.file_in("Needs_Action", stem, ".action.yaml").exists());
}

#[test]
fn invalid_edge_is_refused_with_audit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, _bus, audit, engine) = fixture(dir.path());
    let stem = "c3d4e5";
    seed_plan(&vault, "Pending_Approval", stem);
    let corr = engine
        .tracker()
        .create_context(stem, WorkflowState::PendingApproval);

    // Skipping the review state is not an edge in the matrix.
    let req = TransitionRequest::new(
        stem,
        PLAN_SUFFIX,
        WorkflowState::PendingApproval,
        WorkflowState::Approved,
        &corr,
    );
    let err = engine.transition(&req).expect_err("must refuse");
    assert_eq!(err.kind(), "invalid_transition");
    assert!(vault.file_in("Pending_Approval", stem, PLAN_SUFFIX).exists());

    let invalid = audit
        .query(&AuditQuery {
            event_type: Some("transition.invalid".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(invalid.len(), 1);
}

#[test]
fn existing_target_is_never_overwritten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, _bus, _audit, engine) = fixture(dir.path());
    let stem = "d4e5f6";
    seed_plan(&vault, "Plans", stem);
    fs::write(
        vault.file_in("Pending_Approval", stem, PLAN_SUFFIX),
        b"already here",
    )
    .expect("seed conflicting target");
    let corr = engine.tracker().create_context(stem, WorkflowState::Plans);

    let req = TransitionRequest::new(
        stem,
        PLAN_SUFFIX,
        WorkflowState::Plans,
        WorkflowState::PendingApproval,
        &corr,
    );
    let err = engine.transition(&req).expect_err("must refuse");
    assert_eq!(err.kind(), "target_exists");
    assert_eq!(
        fs::read_to_string(vault.file_in("Pending_Approval", stem, PLAN_SUFFIX)).expect("read"),
        "already here"
    );
    assert!(vault.file_in("Plans", stem, PLAN_SUFFIX).exists());
}

#[test]
fn missing_source_reports_file_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_vault, _bus, _audit, engine) = fixture(dir.path());
    let corr = engine
        .tracker()
        .create_context("nope", WorkflowState::Plans);
    let req = TransitionRequest::new(
        "nope",
        PLAN_SUFFIX,
        WorkflowState::Plans,
        WorkflowState::PendingApproval,
        &corr,
    );
    let err = engine.transition(&req).expect_err("must fail");
    assert_eq!(err.kind(), "file_not_found");
}

#[test]
fn concurrent_movers_on_one_stem_admit_exactly_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, _bus, audit, engine) = fixture(dir.path());
    let stem = "e5f6a7";
    seed_plan(&vault, "Plans", stem);
    let corr = engine.tracker().create_context(stem, WorkflowState::Plans);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        let corr = corr.clone();
        let stem = stem.to_string();
        handles.push(thread::spawn(move || {
            let req = TransitionRequest::new(
                &stem,
                PLAN_SUFFIX,
                WorkflowState::Plans,
                WorkflowState::PendingApproval,
                &corr,
            );
            engine.transition(&req).map(|_| ())
        }));
    }
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "results: {results:?}");
    assert!(vault.file_in("Pending_Approval", stem, PLAN_SUFFIX).exists());
    assert!(!vault.file_in("Plans", stem, PLAN_SUFFIX).exists());

    let loser = results.into_iter().find(|r| r.is_err()).expect("one loser");
    let kind = loser.expect_err("loser").kind();
    assert!(
        kind == "lock_timeout" || kind == "file_not_found" || kind == "invalid_transition",
        "unexpected loser kind {kind}"
    );

    let completed = audit
        .query(&AuditQuery {
            event_type: Some("transition.completed".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(completed.len(), 1);
}

#[test]
fn retry_exhaustion_parks_the_stem_in_dead_letter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, bus, audit, engine) = fixture(dir.path());
    let stem = "f6a7b8";
    seed_plan(&vault, "Plans", stem);
    let corr = engine.tracker().create_context(stem, WorkflowState::Plans);

    // A fresh lock file from a foreign process blocks every attempt.
    fs::write(vault.locks_dir().join(format!("{stem}.lock")), b"99999\n")
        .expect("seed foreign lock");

    let req = TransitionRequest::new(
        stem,
        PLAN_SUFFIX,
        WorkflowState::Plans,
        WorkflowState::PendingApproval,
        &corr,
    );
    let stop = AtomicBool::new(false);
    let err = engine
        .transition_with_retry(&req, &stop)
        .expect_err("must exhaust");
    assert_eq!(err.kind(), "lock_timeout");

    assert!(!vault.file_in("Plans", stem, PLAN_SUFFIX).exists());
    let dlq = engine.dead_letter_queue();
    let entries = dlq.entries(10).expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source_state, WorkflowState::Plans);
    assert_eq!(entries[0].attempts, 3);

    let admitted = audit
        .query(&AuditQuery {
            event_type: Some("dlq.admitted".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(admitted.len(), 1);

    let terminal_failures: Vec<_> = bus
        .history(0, 64)
        .into_iter()
        .filter(|(_, e)| {
            e.event_type == EventType::ActionFailed
                && e.payload.get("terminal").and_then(|v| v.as_bool()) == Some(true)
        })
        .collect();
    assert_eq!(terminal_failures.len(), 1);

    // Round trip: retry restores the file to its recorded source folder.
    fs::remove_file(vault.locks_dir().join(format!("{stem}.lock"))).expect("unblock");
    let restored = dlq.retry(&entries[0].dlq_id).expect("retry");
    assert_eq!(restored, vault.file_in("Plans", stem, PLAN_SUFFIX));
    assert!(restored.exists());
    assert!(dlq.is_empty());
}

#[test]
fn non_retryable_failures_do_not_reach_dead_letter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_vault, _bus, _audit, engine) = fixture(dir.path());
    let corr = engine
        .tracker()
        .create_context("ghost", WorkflowState::Inbox);
    let req = TransitionRequest::new(
        "ghost",
        PLAN_SUFFIX,
        WorkflowState::Inbox,
        WorkflowState::Done,
        &corr,
    );
    let stop = AtomicBool::new(false);
    let err = engine
        .transition_with_retry(&req, &stop)
        .expect_err("must refuse");
    assert_eq!(err.kind(), "invalid_transition");
    assert!(engine.dead_letter_queue().is_empty());
}
