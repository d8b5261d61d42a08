use super::cli::{ApprovalCmd, AuditCmd, Command, CommonOpts, DlqCmd};
use crate::approval::ApprovalRecord;
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::bus::EventBus;
use crate::config::Settings;
use crate::runtime::{
    load_supervisor_state, run_supervisor, stop_active_supervisor, RuntimeError, StatePaths,
};
use crate::shared::fs_atomic::atomic_write_file;
use crate::vault::{VaultPaths, APPROVAL_SUFFIX, PLAN_SUFFIX};
use crate::workflow::{
    CorrelationTracker, DeadLetterQueue, RetryPolicy, TransitionRequest, WorkflowEngine,
    WorkflowState,
};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME: i32 = 1;
const EXIT_USAGE: i32 = 2;

pub fn run(args: &[String]) -> i32 {
    let command = match super::cli::parse(args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("run `vaultflow help` for usage");
            return EXIT_USAGE;
        }
    };

    let result = match command {
        Command::Help => {
            println!("{}", super::cli::help_text());
            Ok(())
        }
        Command::VaultInit { opts } => vault_init(&opts),
        Command::Start { opts, log_level } => start(&opts, log_level),
        Command::Status { opts, json } => status(&opts, json),
        Command::Stop { opts } => stop(&opts),
        Command::Restart { opts, services } => restart(&opts, &services),
        Command::Approval { opts, cmd } => approval(&opts, cmd),
        Command::Dlq { opts, cmd } => dlq(&opts, cmd),
        Command::Audit { opts, cmd } => audit(&opts, cmd),
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("{err}");
            EXIT_RUNTIME
        }
    }
}

fn resolve_settings(opts: &CommonOpts) -> Result<Settings, String> {
    if let Some(config) = &opts.config {
        return Settings::load(config).map_err(|e| e.to_string());
    }
    let vault = opts
        .vault
        .clone()
        .or_else(|| std::env::var("VAULTFLOW_VAULT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./Vault"));
    Settings::load_or_default(&vault).map_err(|e| e.to_string())
}

/// Minimal component set for one-shot commands: a bus nobody subscribes
/// to, the audit chain, and a transition engine.
struct CliContext {
    vault: VaultPaths,
    audit: Arc<AuditLog>,
    engine: WorkflowEngine,
}

fn cli_context(settings: &Settings) -> Result<CliContext, String> {
    let vault = VaultPaths::new(&settings.vault_path);
    if !vault.exists() {
        return Err(format!(
            "vault at {} is not initialized; run `vaultflow vault init`",
            vault.root.display()
        ));
    }
    let audit = Arc::new(
        AuditLog::open(&settings.audit_log_path(), &vault.integrity_dir())
            .map_err(|e| e.to_string())?,
    );
    let bus = Arc::new(EventBus::new(
        &vault.root,
        settings.bus.history_size,
        settings.bus.subscriber_queue,
    ));
    let tracker = Arc::new(CorrelationTracker::new());
    tracker.rebuild_from_vault(&vault);
    let engine = WorkflowEngine::new(
        vault.clone(),
        bus,
        Arc::clone(&audit),
        tracker,
        RetryPolicy {
            base_ms: settings.retry.base_ms,
            cap_ms: settings.retry.cap_ms,
            max_attempts: settings.retry.max_attempts,
        },
        settings.lock.timeout_ms,
        settings.lock.stale_ms,
    );
    Ok(CliContext {
        vault,
        audit,
        engine,
    })
}

fn vault_init(opts: &CommonOpts) -> Result<(), String> {
    let settings = resolve_settings(opts)?;
    let vault = VaultPaths::new(&settings.vault_path);
    vault.initialize().map_err(|e| e.to_string())?;
    vault.check_single_filesystem().map_err(|e| e.to_string())?;

    let config_path = vault.root.join("config.yaml");
    if !config_path.exists() {
        settings.save(&config_path).map_err(|e| e.to_string())?;
    }
    println!("vault initialized at {}", vault.root.display());
    println!("config: {}", config_path.display());
    Ok(())
}

fn start(opts: &CommonOpts, log_level: Option<String>) -> Result<(), String> {
    if let Some(level) = log_level {
        std::env::set_var("VAULTFLOW_LOG_LEVEL", level);
    }
    let settings = resolve_settings(opts)?;
    run_supervisor(&settings).map_err(|e| e.to_string())
}

fn status(opts: &CommonOpts, as_json: bool) -> Result<(), String> {
    let settings = resolve_settings(opts)?;
    let vault = VaultPaths::new(&settings.vault_path);
    if !vault.exists() {
        return Err(format!(
            "vault at {} is not initialized",
            vault.root.display()
        ));
    }
    let paths = StatePaths::new(vault.clone());
    let state = load_supervisor_state(&paths).map_err(|e| e.to_string())?;
    let counts = vault.folder_counts();

    if as_json {
        let body = json!({
            "running": state.running,
            "pid": state.pid,
            "started_at": state.started_at,
            "services": state.services,
            "folders": counts,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    println!(
        "supervisor: {}",
        if state.running {
            format!("running (pid {})", state.pid.unwrap_or(0))
        } else {
            "stopped".to_string()
        }
    );
    for (name, record) in &state.services {
        println!("  {name}: {}", record.state.as_str());
    }
    println!("folders:");
    for (folder, count) in counts {
        println!("  {folder}: {count}");
    }
    Ok(())
}

fn stop(opts: &CommonOpts) -> Result<(), String> {
    let settings = resolve_settings(opts)?;
    let paths = StatePaths::new(VaultPaths::new(&settings.vault_path));
    match stop_active_supervisor(&paths, Duration::from_secs(10)) {
        Ok(result) => {
            println!(
                "stopped supervisor pid {}{}",
                result.pid,
                if result.forced { " (forced)" } else { "" }
            );
            Ok(())
        }
        Err(RuntimeError::NotRunning) => Err("no running supervisor instance".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

fn restart(opts: &CommonOpts, services: &[String]) -> Result<(), String> {
    if !services.is_empty() {
        eprintln!(
            "note: per-service restart is not supported; restarting the whole supervisor ({})",
            services.join(", ")
        );
    }
    let settings = resolve_settings(opts)?;
    let paths = StatePaths::new(VaultPaths::new(&settings.vault_path));
    match stop_active_supervisor(&paths, Duration::from_secs(10)) {
        Ok(result) => println!("stopped supervisor pid {}", result.pid),
        Err(RuntimeError::NotRunning) => {}
        Err(err) => return Err(err.to_string()),
    }
    run_supervisor(&settings).map_err(|e| e.to_string())
}

fn approval(opts: &CommonOpts, cmd: ApprovalCmd) -> Result<(), String> {
    let settings = resolve_settings(opts)?;

    match cmd {
        ApprovalCmd::List => {
            let vault = VaultPaths::new(&settings.vault_path);
            let entries = vault
                .sorted_entries("Pending_Approval")
                .map_err(|e| e.to_string())?;
            let mut shown = 0usize;
            for path in entries {
                let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                    continue;
                };
                if !name.ends_with(APPROVAL_SUFFIX) {
                    continue;
                }
                let record = ApprovalRecord::read(&path).map_err(|e| e.to_string())?;
                println!(
                    "{}  {}  risk={}  requested={}",
                    record.action_id, record.decision, record.risk_level, record.requested_at
                );
                shown += 1;
            }
            if shown == 0 {
                println!("no pending approvals");
            }
            Ok(())
        }
        ApprovalCmd::Show { id } => {
            let vault = VaultPaths::new(&settings.vault_path);
            let path = vault.file_in("Pending_Approval", &id, APPROVAL_SUFFIX);
            let record = ApprovalRecord::read(&path).map_err(|e| e.to_string())?;
            println!("id:          {}", record.id);
            println!("action_id:   {}", record.action_id);
            println!("plan_id:     {}", record.plan_id);
            println!("decision:    {}", record.decision);
            println!("risk_level:  {}", record.risk_level);
            println!("reason:      {}", record.reason);
            println!("requested:   {}", record.requested_at);
            println!(
                "resolved:    {}",
                record.resolved_at.as_deref().unwrap_or("pending")
            );
            Ok(())
        }
        ApprovalCmd::Approve { id, reason } => {
            let ctx = cli_context(&settings)?;
            resolve_record(&ctx, &id, "operator", reason.as_deref())?;
            for (from, to) in [
                (WorkflowState::PendingApproval, WorkflowState::ApprovalReview),
                (WorkflowState::ApprovalReview, WorkflowState::Approved),
            ] {
                let correlation_id = ctx
                    .engine
                    .tracker()
                    .by_action_id(&id)
                    .map(|c| c.correlation_id)
                    .unwrap_or_default();
                let req = TransitionRequest::new(&id, PLAN_SUFFIX, from, to, &correlation_id);
                ctx.engine.transition(&req).map_err(|e| e.to_string())?;
            }
            let _ = ctx.audit.append(
                AuditEntryDraft::new("approval.granted", "cli")
                    .action("approve")
                    .resource("stem", &id)
                    .detail("approver", json!("operator"))
                    .detail("reason", json!(reason)),
            );
            println!("approved {id}; plan released to Approved");
            Ok(())
        }
        ApprovalCmd::Reject { id, reason } => {
            let ctx = cli_context(&settings)?;
            resolve_record(&ctx, &id, "operator", Some(&reason))?;
            for (from, to) in [
                (WorkflowState::PendingApproval, WorkflowState::ApprovalReview),
                (WorkflowState::ApprovalReview, WorkflowState::Rejected),
            ] {
                let correlation_id = ctx
                    .engine
                    .tracker()
                    .by_action_id(&id)
                    .map(|c| c.correlation_id)
                    .unwrap_or_default();
                let req = TransitionRequest::new(&id, PLAN_SUFFIX, from, to, &correlation_id);
                ctx.engine.transition(&req).map_err(|e| e.to_string())?;
            }
            let _ = ctx.audit.append(
                AuditEntryDraft::new("approval.rejected", "cli")
                    .action("reject")
                    .resource("stem", &id)
                    .detail("approver", json!("operator"))
                    .detail("reason", json!(reason)),
            );
            println!("rejected {id}: {reason}");
            Ok(())
        }
        ApprovalCmd::History { limit } => {
            let vault = VaultPaths::new(&settings.vault_path);
            let audit = AuditLog::open(&settings.audit_log_path(), &vault.integrity_dir())
                .map_err(|e| e.to_string())?;
            let entries = audit.tail(limit * 4).map_err(|e| e.to_string())?;
            let mut shown = 0usize;
            for entry in entries.into_iter().rev() {
                if !entry.event_type.starts_with("approval.") {
                    continue;
                }
                println!(
                    "{}  {}  {}  {}",
                    entry.timestamp, entry.event_type, entry.resource_id, entry.correlation_id
                );
                shown += 1;
                if shown >= limit {
                    break;
                }
            }
            if shown == 0 {
                println!("no approval history");
            }
            Ok(())
        }
        ApprovalCmd::Reload => {
            let paths = StatePaths::new(VaultPaths::new(&settings.vault_path));
            atomic_write_file(&paths.rules_reload_path(), b"reload")
                .map_err(|e| e.to_string())?;
            println!("reload requested; a running supervisor will swap rules atomically");
            Ok(())
        }
    }
}

/// Resolves the sidecar approval record (when present) and retires it to
/// Archived.
fn resolve_record(
    ctx: &CliContext,
    stem: &str,
    approver: &str,
    reason: Option<&str>,
) -> Result<(), String> {
    let record_path = ctx.vault.file_in("Pending_Approval", stem, APPROVAL_SUFFIX);
    if !record_path.exists() {
        return Ok(());
    }
    let mut record = ApprovalRecord::read(&record_path).map_err(|e| e.to_string())?;
    record.resolve(approver);
    if let Some(reason) = reason {
        record.reason = reason.to_string();
    }
    record.write(&record_path).map_err(|e| e.to_string())?;
    let archived = ctx.vault.file_in("Archived", stem, APPROVAL_SUFFIX);
    crate::shared::fs_atomic::atomic_move_file(&record_path, &archived).map_err(|e| e.to_string())
}

fn dlq(opts: &CommonOpts, cmd: DlqCmd) -> Result<(), String> {
    let settings = resolve_settings(opts)?;
    let vault = VaultPaths::new(&settings.vault_path);
    let queue = DeadLetterQueue::new(vault);

    match cmd {
        DlqCmd::List => {
            let entries = queue.entries(100).map_err(|e| e.to_string())?;
            if entries.is_empty() {
                println!("dead letter queue is empty");
            }
            for entry in entries {
                println!(
                    "{}  {}  from={}  attempts={}  {}",
                    entry.dlq_id,
                    entry.original_filename,
                    entry.source_state,
                    entry.attempts,
                    entry.error
                );
            }
            Ok(())
        }
        DlqCmd::Retry { id } => {
            let restored = queue.retry(&id).map_err(|e| e.to_string())?;
            println!("restored {}", restored.display());
            Ok(())
        }
        DlqCmd::Purge { days } => {
            let purged = queue.purge(days).map_err(|e| e.to_string())?;
            println!("purged {purged} dead-letter entries older than {days} days");
            Ok(())
        }
    }
}

fn audit(opts: &CommonOpts, cmd: AuditCmd) -> Result<(), String> {
    let settings = resolve_settings(opts)?;
    let vault = VaultPaths::new(&settings.vault_path);
    let audit = AuditLog::open(&settings.audit_log_path(), &vault.integrity_dir())
        .map_err(|e| e.to_string())?;

    match cmd {
        AuditCmd::Verify => {
            let verification = audit.verify_chain().map_err(|e| e.to_string())?;
            if verification.valid {
                println!(
                    "audit chain valid ({} entries)",
                    verification.total_entries
                );
                Ok(())
            } else {
                Err(format!(
                    "audit chain BROKEN: first invalid seq {} ({} invalid entries)\n{}",
                    verification.first_invalid_seq.unwrap_or(0),
                    verification.invalid_entries,
                    verification.issues.join("\n")
                ))
            }
        }
        AuditCmd::Export { out } => {
            let export = audit.export().map_err(|e| e.to_string())?;
            let body = serde_json::to_string_pretty(&export).map_err(|e| e.to_string())?;
            match out {
                Some(path) => {
                    fs::write(&path, body).map_err(|e| e.to_string())?;
                    println!("exported audit log to {}", path.display());
                }
                None => println!("{body}"),
            }
            Ok(())
        }
    }
}
