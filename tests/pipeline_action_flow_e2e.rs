use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use vaultflow::approval::ApprovalRuleEngine;
use vaultflow::audit::{AuditLog, AuditQuery};
use vaultflow::bus::EventBus;
use vaultflow::execution::{
    AdapterRegistry, ExecutionEngine, ExecutionMode, RollbackStrategy,
};
use vaultflow::runtime::{PipelineWorker, TemplatePlanner};
use vaultflow::shared::ids::split_stem_suffix;
use vaultflow::vault::{VaultPaths, APPROVAL_SUFFIX, PLAN_SUFFIX};
use vaultflow::workflow::{CorrelationTracker, RetryPolicy, WorkflowEngine};

struct Fixture {
    vault: VaultPaths,
    audit: Arc<AuditLog>,
    engine: Arc<WorkflowEngine>,
    pipeline: PipelineWorker,
}

fn fixture(root: &Path, mode: ExecutionMode) -> Fixture {
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
    let retry = RetryPolicy {
        base_ms: 1,
        cap_ms: 10,
        max_attempts: 3,
    };
    let engine = Arc::new(WorkflowEngine::new(
        vault.clone(),
        bus,
        Arc::clone(&audit),
        tracker,
        retry,
        1_000,
        300_000,
    ));
    let execution = Arc::new(ExecutionEngine::new(
        mode,
        RollbackStrategy::Automatic,
        2_000,
        retry,
        AdapterRegistry::new(),
        Arc::clone(&audit),
        &vault.root,
    ));
    let pipeline = PipelineWorker::new(
        Arc::clone(&engine),
        execution,
        Arc::new(ApprovalRuleEngine::default()),
        Arc::new(TemplatePlanner),
        Arc::new(AtomicBool::new(false)),
    );
    Fixture {
        vault,
        audit,
        engine,
        pipeline,
    }
}

/// Exactly one pipeline file per stem may sit in the non-terminal
/// folders; approval records are sidecar metadata and do not count.
fn non_terminal_occupancy(vault: &VaultPaths, stem: &str) -> usize {
    let mut count = 0;
    for folder in [
        "Inbox",
        "Needs_Action",
        "Plans",
        "Pending_Approval",
        "Approved",
        "Failed",
        "Rejected",
        "Retry",
    ] {
        let Ok(entries) = vault.sorted_entries(folder) else {
            continue;
        };
        for path in entries {
            let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            match split_stem_suffix(name) {
                Some((s, suffix)) if s == stem && suffix != APPROVAL_SUFFIX => count += 1,
                _ => {}
            }
        }
    }
    count
}

#[test]
fn low_risk_email_auto_approves_to_done_in_dry_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fx = fixture(dir.path(), ExecutionMode::DryRun);

    let raw = fx.vault.folder("Inbox").join("hello.txt");
    fs::write(&raw, "type: email_response\n").expect("drop inbox file");

    let ingest = fx
        .engine
        .ingest_inbox_file(&raw, "file_watcher")
        .expect("ingest");
    fx.pipeline
        .process_action(&ingest.stem, &ingest.correlation_id)
        .expect("process");

    let stem = &ingest.stem;
    assert!(fx.vault.file_in("Done", stem, PLAN_SUFFIX).exists());
    assert!(fx
        .vault
        .file_in("Archived", stem, ".action.yaml")
        .exists());
    assert!(fx.vault.folder("Archived").join(format!("{stem}.txt")).exists());
    assert_eq!(
        fx.vault.count_entries("Pending_Approval").expect("count"),
        0
    );
    assert_eq!(non_terminal_occupancy(&fx.vault, stem), 0);

    let auto = fx
        .audit
        .query(&AuditQuery {
            event_type: Some("approval.auto_approve".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(auto.len(), 1);
    assert_eq!(
        auto[0].details.get("risk_level").and_then(|v| v.as_str()),
        Some("low")
    );

    let completed = fx
        .audit
        .query(&AuditQuery {
            event_type: Some("execution.completed".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].details.get("mode").and_then(|v| v.as_str()),
        Some("DRY_RUN")
    );
    assert_eq!(
        completed[0].details.get("status").and_then(|v| v.as_str()),
        Some("succeeded")
    );
}

#[test]
fn long_data_analysis_waits_for_a_human_then_executes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fx = fixture(dir.path(), ExecutionMode::DryRun);

    let raw = fx.vault.folder("Inbox").join("analysis.txt");
    fs::write(
        &raw,
        "type: data_analysis\nestimated_duration_min: 180\n",
    )
    .expect("drop inbox file");

    let ingest = fx
        .engine
        .ingest_inbox_file(&raw, "file_watcher")
        .expect("ingest");
    fx.pipeline
        .process_action(&ingest.stem, &ingest.correlation_id)
        .expect("process");

    let stem = &ingest.stem;
    let pending_plan = fx.vault.file_in("Pending_Approval", stem, PLAN_SUFFIX);
    assert!(pending_plan.exists(), "plan must rest in Pending_Approval");
    assert!(fx
        .vault
        .file_in("Pending_Approval", stem, APPROVAL_SUFFIX)
        .exists());
    assert_eq!(non_terminal_occupancy(&fx.vault, stem), 1);

    let required = fx
        .audit
        .query(&AuditQuery {
            event_type: Some("approval.required".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(required.len(), 1);
    assert!(required[0]
        .details
        .get("matched_rule_id")
        .and_then(|v| v.as_str())
        .is_some());

    assert!(fx
        .audit
        .query(&AuditQuery {
            event_type: Some("execution.completed".to_string()),
            ..AuditQuery::default()
        })
        .expect("query")
        .is_empty());

    // The human moves the plan to Approved by hand.
    fs::rename(&pending_plan, fx.vault.file_in("Approved", stem, PLAN_SUFFIX))
        .expect("manual move");
    fx.pipeline
        .handle_human_approval(stem)
        .expect("human approval");

    assert!(fx.vault.file_in("Done", stem, PLAN_SUFFIX).exists());
    assert_eq!(non_terminal_occupancy(&fx.vault, stem), 0);
    assert!(
        fx.vault.file_in("Archived", stem, APPROVAL_SUFFIX).exists(),
        "resolved approval record is archived"
    );

    let completed = fx
        .audit
        .query(&AuditQuery {
            event_type: Some("execution.completed".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(completed.len(), 1);

    let granted = fx
        .audit
        .query(&AuditQuery {
            event_type: Some("approval.granted".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(granted.len(), 1);
    assert_eq!(
        granted[0].details.get("approver").and_then(|v| v.as_str()),
        Some("human")
    );
}

#[test]
fn done_requires_a_prior_execution_completed_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fx = fixture(dir.path(), ExecutionMode::DryRun);

    let raw = fx.vault.folder("Inbox").join("note.txt");
    fs::write(&raw, "type: follow_up\nestimated_duration_min: 10\n").expect("drop");
    let ingest = fx
        .engine
        .ingest_inbox_file(&raw, "file_watcher")
        .expect("ingest");
    fx.pipeline
        .process_action(&ingest.stem, &ingest.correlation_id)
        .expect("process");

    assert!(fx.vault.file_in("Done", &ingest.stem, PLAN_SUFFIX).exists());
    let completed = fx
        .audit
        .query(&AuditQuery {
            correlation_id: Some(ingest.correlation_id.clone()),
            event_type: Some("execution.completed".to_string()),
            ..AuditQuery::default()
        })
        .expect("query");
    assert_eq!(
        completed.len(), 1,
        "a file in Done always has a prior execution.completed entry"
    );
}
