use std::sync::Arc;
use vaultflow::audit::{AuditEntryDraft, AuditLog};
use vaultflow::bus::EventBus;
use vaultflow::execution::{AdapterRegistry, ExecutionEngine, ExecutionMode, RollbackStrategy};
use vaultflow::runtime::{DashboardWriter, ServiceBoard, ServiceState};
use vaultflow::vault::VaultPaths;
use vaultflow::workflow::{CorrelationTracker, RetryPolicy, WorkflowEngine};

fn writer(root: &std::path::Path) -> (VaultPaths, DashboardWriter, Arc<AuditLog>) {
    let vault = VaultPaths::new(root.join("vault"));
    vault.initialize().expect("init vault");
    let audit = Arc::new(
        AuditLog::open(
            &vault.audit_dir().join("immutable_audit.jsonl"),
            &vault.integrity_dir(),
        )
        .expect("open audit"),
    );
    let bus = Arc::new(EventBus::new(&vault.root, 64, 64));
    let tracker = Arc::new(CorrelationTracker::new());
    let retry = RetryPolicy::default();
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
        ExecutionMode::DryRun,
        RollbackStrategy::Automatic,
        1_000,
        retry,
        AdapterRegistry::new(),
        Arc::clone(&audit),
        &vault.root,
    ));
    let board = ServiceBoard::new();
    board.set_state("inbox_watcher", ServiceState::Running);
    let writer = DashboardWriter::new(
        vault.clone(),
        Arc::clone(&audit),
        board,
        engine,
        execution,
        30_000,
    );
    (vault, writer, audit)
}

#[test]
fn dashboard_snapshot_carries_counts_services_and_audit_tail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, writer, audit) = writer(dir.path());
    std::fs::write(vault.folder("Inbox").join("x.txt"), b"hi").expect("seed");
    audit
        .append(AuditEntryDraft::new("transition.completed", "workflow_engine"))
        .expect("append");

    writer.write_once();
    let body = std::fs::read_to_string(vault.dashboard_file()).expect("dashboard");

    assert!(body.contains("# Vaultflow Dashboard"));
    assert!(body.contains("**Inbox**: 1"));
    assert!(body.contains("**inbox_watcher**: running"));
    assert!(body.contains("transition.completed"));
    assert!(body.contains("## Metrics"));
}

#[test]
fn dashboard_rewrites_are_atomic_replacements() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (vault, writer, _audit) = writer(dir.path());

    writer.write_once();
    let first = std::fs::read_to_string(vault.dashboard_file()).expect("read");
    writer.write_once();
    let second = std::fs::read_to_string(vault.dashboard_file()).expect("read");

    // Same structure either way; the file is fully replaced, never
    // appended to.
    assert_eq!(
        first.matches("# Vaultflow Dashboard").count(),
        second.matches("# Vaultflow Dashboard").count()
    );
}
