use vaultflow::app;

fn args(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[test]
fn unknown_commands_exit_with_usage_error() {
    assert_eq!(app::run(&args(&["explode"])), 2);
    assert_eq!(app::run(&args(&["approval", "reject", "x"])), 2);
}

#[test]
fn vault_init_then_status_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = dir.path().join("vault");
    let vault_arg = vault.display().to_string();

    assert_eq!(app::run(&args(&["vault", "init", "--vault", &vault_arg])), 0);
    assert!(vault.join("Inbox").is_dir());
    assert!(vault.join("Dashboard.md").is_file());
    assert!(vault.join("config.yaml").is_file());

    assert_eq!(app::run(&args(&["status", "--vault", &vault_arg])), 0);
    assert_eq!(
        app::run(&args(&["status", "--json", "--vault", &vault_arg])),
        0
    );
}

#[test]
fn status_on_missing_vault_is_a_runtime_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault_arg = dir.path().join("absent").display().to_string();
    assert_eq!(app::run(&args(&["status", "--vault", &vault_arg])), 1);
}

#[test]
fn stop_without_a_running_supervisor_fails_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = dir.path().join("vault");
    let vault_arg = vault.display().to_string();
    assert_eq!(app::run(&args(&["vault", "init", "--vault", &vault_arg])), 0);
    assert_eq!(app::run(&args(&["stop", "--vault", &vault_arg])), 1);
}

#[test]
fn audit_verify_passes_on_a_fresh_vault() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault_arg = dir.path().join("vault").display().to_string();
    assert_eq!(app::run(&args(&["vault", "init", "--vault", &vault_arg])), 0);
    assert_eq!(app::run(&args(&["audit", "verify", "--vault", &vault_arg])), 0);
}

#[test]
fn dlq_list_reports_an_empty_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault_arg = dir.path().join("vault").display().to_string();
    assert_eq!(app::run(&args(&["vault", "init", "--vault", &vault_arg])), 0);
    assert_eq!(app::run(&args(&["dlq", "list", "--vault", &vault_arg])), 0);
    assert_eq!(
        app::run(&args(&["dlq", "purge", "--days", "30", "--vault", &vault_arg])),
        0
    );
}

#[test]
fn approval_approve_releases_the_plan_to_approved() {
    use vaultflow::approval::{ApprovalDecision, ApprovalRecord, RiskLevel};
    use vaultflow::execution::{Plan, PlanStatus};
    use vaultflow::vault::{VaultPaths, APPROVAL_SUFFIX, PLAN_SUFFIX};

    let dir = tempfile::tempdir().expect("tempdir");
    let vault_root = dir.path().join("vault");
    let vault_arg = vault_root.display().to_string();
    assert_eq!(app::run(&args(&["vault", "init", "--vault", &vault_arg])), 0);

    let vault = VaultPaths::new(&vault_root);
    let stem = "cafe01";
    let mut plan = Plan::new(stem, "corr-1");
    plan.touch(PlanStatus::PendingApproval);
    plan.write(&vault.file_in("Pending_Approval", stem, PLAN_SUFFIX))
        .expect("seed plan");
    ApprovalRecord::new(
        stem,
        &plan.id,
        ApprovalDecision::RequireApproval,
        RiskLevel::High,
        "seeded for test",
        None,
        Vec::new(),
    )
    .write(&vault.file_in("Pending_Approval", stem, APPROVAL_SUFFIX))
    .expect("seed record");

    assert_eq!(
        app::run(&args(&["approval", "list", "--vault", &vault_arg])),
        0
    );
    assert_eq!(
        app::run(&args(&["approval", "show", stem, "--vault", &vault_arg])),
        0
    );
    assert_eq!(
        app::run(&args(&[
            "approval", "approve", stem, "-r", "looks fine", "--vault", &vault_arg
        ])),
        0
    );

    assert!(vault.file_in("Approved", stem, PLAN_SUFFIX).exists());
    assert!(!vault.file_in("Pending_Approval", stem, PLAN_SUFFIX).exists());
    let archived = ApprovalRecord::read(&vault.file_in("Archived", stem, APPROVAL_SUFFIX))
        .expect("archived record");
    assert!(archived.is_resolved());
    assert_eq!(
        app::run(&args(&["approval", "history", "--vault", &vault_arg])),
        0
    );
}

#[test]
fn approval_reload_drops_the_sentinel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = dir.path().join("vault");
    let vault_arg = vault.display().to_string();
    assert_eq!(app::run(&args(&["vault", "init", "--vault", &vault_arg])), 0);
    assert_eq!(
        app::run(&args(&["approval", "reload", "--vault", &vault_arg])),
        0
    );
    assert!(vault.join("System_Log/rules.reload").is_file());
}
