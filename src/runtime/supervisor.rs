use super::dashboard::DashboardWriter;
use super::health::{run_health_sweep, ServiceBoard, ServiceHealthRecord};
use super::ownership_lock::{
    cleanup_stale_supervisor, clear_start_lock, reserve_start_lock, supervisor_ownership_state,
    OwnershipState,
};
use super::pipeline::PipelineWorker;
use super::planner::{Planner, TemplatePlanner};
use super::service::{Service, ServiceState, WorkerService};
use super::state_paths::StatePaths;
use super::watcher::InboxWatcher;
use crate::approval::ApprovalRuleEngine;
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::bus::{Event, EventBus, EventType, SubscribeMode};
use crate::config::Settings;
use crate::execution::{AdapterRegistry, ExecutionEngine};
use crate::shared::errors::RuntimeError;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::append_runtime_log;
use crate::shared::time::now_secs;
use crate::vault::VaultPaths;
use crate::workflow::{CorrelationTracker, RetryPolicy, WorkflowEngine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceHealthRecord>,
    pub last_error: Option<String>,
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Everything the orchestrator wires together for one run.
pub struct Runtime {
    pub vault: VaultPaths,
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditLog>,
    pub tracker: Arc<CorrelationTracker>,
    pub engine: Arc<WorkflowEngine>,
    pub execution: Arc<ExecutionEngine>,
    pub approvals: Arc<ApprovalRuleEngine>,
    pub pipeline: Arc<PipelineWorker>,
    pub stop: Arc<AtomicBool>,
}

fn start_error(service: &str, reason: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::ServiceStart {
        service: service.to_string(),
        reason: reason.to_string(),
    }
}

/// Builds the component graph: bus, audit chain, correlation tracker,
/// workflow engine, approval rules, execution engine, and the pipeline
/// worker subscribed to the bus.
pub fn build_runtime(
    settings: &Settings,
    planner: Arc<dyn Planner>,
    adapters: AdapterRegistry,
) -> Result<Runtime, RuntimeError> {
    let vault = VaultPaths::new(&settings.vault_path);
    vault.initialize().map_err(|e| start_error("vault", e))?;
    vault
        .check_single_filesystem()
        .map_err(|e| start_error("vault", e))?;

    let audit = Arc::new(
        AuditLog::open(&settings.audit_log_path(), &vault.integrity_dir())
            .map_err(|e| start_error("audit", e))?,
    );
    let bus = Arc::new(EventBus::new(
        &vault.root,
        settings.bus.history_size,
        settings.bus.subscriber_queue,
    ));
    let tracker = Arc::new(CorrelationTracker::new());
    tracker.restore(&vault.open_contexts_file(), &vault);

    let retry = RetryPolicy {
        base_ms: settings.retry.base_ms,
        cap_ms: settings.retry.cap_ms,
        max_attempts: settings.retry.max_attempts,
    };
    let engine = Arc::new(WorkflowEngine::new(
        vault.clone(),
        Arc::clone(&bus),
        Arc::clone(&audit),
        Arc::clone(&tracker),
        retry,
        settings.lock.timeout_ms,
        settings.lock.stale_ms,
    ));
    let approvals = Arc::new(
        ApprovalRuleEngine::from_configs(&settings.approval.rules)
            .map_err(|e| start_error("approval_rules", e))?,
    );
    let execution = Arc::new(ExecutionEngine::new(
        settings.execution.mode,
        settings.execution.rollback_strategy,
        settings.execution.step_timeout_ms,
        retry,
        adapters,
        Arc::clone(&audit),
        &vault.root,
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let pipeline = Arc::new(PipelineWorker::new(
        Arc::clone(&engine),
        Arc::clone(&execution),
        Arc::clone(&approvals),
        planner,
        Arc::clone(&stop),
    ));

    let subscriber = Arc::clone(&pipeline);
    bus.subscribe(
        "pipeline_worker",
        &[
            EventType::FileCreated,
            EventType::ActionGenerated,
            EventType::ActionApproved,
        ],
        SubscribeMode::Async,
        Box::new(move |event| subscriber.handle_event(event)),
    );

    let shutdown_stop = Arc::clone(&stop);
    bus.subscribe(
        "shutdown_listener",
        &[EventType::SystemShutdown],
        SubscribeMode::Sync,
        Box::new(move |_event| {
            shutdown_stop.store(true, Ordering::Relaxed);
            Ok(())
        }),
    );

    Ok(Runtime {
        vault,
        bus,
        audit,
        tracker,
        engine,
        execution,
        approvals,
        pipeline,
        stop,
    })
}

/// Foreground supervisor: builds the runtime, starts the services in
/// dependency order, then polls for the stop and rules-reload sentinels
/// and runs health sweeps until told to quit.
pub fn run_supervisor(settings: &Settings) -> Result<(), RuntimeError> {
    let runtime = build_runtime(settings, Arc::new(TemplatePlanner), AdapterRegistry::new())?;
    let paths = StatePaths::new(runtime.vault.clone());

    match supervisor_ownership_state(&paths)? {
        OwnershipState::Running { pid } => return Err(RuntimeError::AlreadyRunning { pid }),
        OwnershipState::Stale => cleanup_stale_supervisor(&paths)?,
        OwnershipState::NotRunning => {}
    }
    reserve_start_lock(&paths)?;
    let _ = fs::remove_file(paths.stop_signal_path());

    let board = ServiceBoard::new();
    let services = build_services(settings, &runtime, &board);

    let mut state = SupervisorState {
        running: true,
        pid: Some(std::process::id()),
        started_at: Some(now_secs()),
        stopped_at: None,
        services: BTreeMap::new(),
        last_error: None,
    };
    save_supervisor_state(&paths, &state)?;
    append_runtime_log(
        &runtime.vault.root,
        "info",
        "supervisor.started",
        &format!("pid={} services={}", std::process::id(), services.len()),
    );

    if let Err(err) = start_services(&services, &board, &runtime) {
        state.running = false;
        state.pid = None;
        state.last_error = Some(err.to_string());
        state.services = board.snapshot();
        let _ = save_supervisor_state(&paths, &state);
        clear_start_lock(&paths);
        return Err(err);
    }

    let health_interval = Duration::from_millis(settings.health.interval_ms);
    let health_timeout = Duration::from_millis(settings.health.timeout_ms);
    let mut last_sweep = Instant::now();

    while !runtime.stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            runtime.stop.store(true, Ordering::Relaxed);
            append_runtime_log(
                &runtime.vault.root,
                "info",
                "supervisor.stop.signal",
                "stop sentinel detected",
            );
            break;
        }
        if paths.rules_reload_path().exists() {
            reload_rules(settings, &runtime, &paths);
        }
        if last_sweep.elapsed() >= health_interval {
            run_health_sweep(&services, &board, &runtime.bus, health_timeout);
            state.services = board.snapshot();
            let _ = save_supervisor_state(&paths, &state);
            last_sweep = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    shutdown(settings, &runtime, &paths, &services, &board, &mut state);
    Ok(())
}

fn build_services(
    settings: &Settings,
    runtime: &Runtime,
    board: &ServiceBoard,
) -> Vec<Arc<dyn Service>> {
    let watcher = InboxWatcher::new(
        runtime.vault.clone(),
        Arc::clone(&runtime.bus),
        Arc::clone(&runtime.tracker),
    );
    let watcher_service: Arc<dyn Service> = Arc::new(WorkerService::new(
        "inbox_watcher",
        Duration::from_secs(30),
        Box::new(move |ctx| watcher.run(ctx)),
    ));

    let dashboard = DashboardWriter::new(
        runtime.vault.clone(),
        Arc::clone(&runtime.audit),
        board.clone(),
        Arc::clone(&runtime.engine),
        Arc::clone(&runtime.execution),
        settings.dashboard.interval_ms,
    );
    let dashboard_service: Arc<dyn Service> = Arc::new(WorkerService::new(
        "dashboard_writer",
        Duration::from_millis(settings.dashboard.interval_ms * 3),
        Box::new(move |ctx| dashboard.run(ctx)),
    ));

    vec![watcher_service, dashboard_service]
}

/// Starts services in declared order; any failure rewinds the already
/// started ones in reverse order.
fn start_services(
    services: &[Arc<dyn Service>],
    board: &ServiceBoard,
    runtime: &Runtime,
) -> Result<(), RuntimeError> {
    let mut started: Vec<Arc<dyn Service>> = Vec::new();
    for service in services {
        let name = service.name();
        board.set_state(&name, ServiceState::Starting);
        match service.start() {
            Ok(()) => {
                board.set_state(&name, ServiceState::Running);
                runtime.bus.publish(
                    Event::new(EventType::ServiceStarted, "orchestrator")
                        .with_payload("service", json!(name)),
                );
                let _ = runtime.audit.append(
                    AuditEntryDraft::new("service.started", "orchestrator")
                        .resource("service", &name),
                );
                started.push(Arc::clone(service));
            }
            Err(err) => {
                board.set_error(&name, &err.to_string());
                runtime.bus.publish(
                    Event::new(EventType::ServiceError, "orchestrator")
                        .with_payload("service", json!(name))
                        .with_payload("error", json!(err.to_string())),
                );
                for rewind in started.iter().rev() {
                    rewind.stop();
                    board.set_state(&rewind.name(), ServiceState::Stopped);
                    runtime.bus.publish(
                        Event::new(EventType::ServiceStopped, "orchestrator")
                            .with_payload("service", json!(rewind.name())),
                    );
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

fn reload_rules(settings: &Settings, runtime: &Runtime, paths: &StatePaths) {
    let _ = fs::remove_file(paths.rules_reload_path());
    let fresh = Settings::load_or_default(&settings.vault_path)
        .map(|s| s.approval.rules)
        .unwrap_or_default();
    match runtime.approvals.replace_rules(&fresh) {
        Ok(count) => {
            let _ = runtime.audit.append(
                AuditEntryDraft::new("rules.reloaded", "orchestrator")
                    .detail("rule_count", json!(count)),
            );
            append_runtime_log(
                &runtime.vault.root,
                "info",
                "approval.rules.reloaded",
                &format!("rules={count}"),
            );
        }
        Err(err) => {
            append_runtime_log(
                &runtime.vault.root,
                "error",
                "approval.rules.reload_failed",
                &err,
            );
        }
    }
}

fn shutdown(
    settings: &Settings,
    runtime: &Runtime,
    paths: &StatePaths,
    services: &[Arc<dyn Service>],
    board: &ServiceBoard,
    state: &mut SupervisorState,
) {
    runtime.stop.store(true, Ordering::Relaxed);

    for service in services.iter().rev() {
        let name = service.name();
        board.set_state(&name, ServiceState::Stopping);
        service.stop();
        board.set_state(&name, ServiceState::Stopped);
        runtime.bus.publish(
            Event::new(EventType::ServiceStopped, "orchestrator")
                .with_payload("service", json!(name)),
        );
        let _ = runtime.audit.append(
            AuditEntryDraft::new("service.stopped", "orchestrator").resource("service", &name),
        );
    }

    let stats = runtime
        .bus
        .shutdown(Duration::from_millis(settings.bus.drain_ms));
    let _ = runtime.audit.flush();
    if let Err(err) = runtime.tracker.snapshot(&runtime.vault.open_contexts_file()) {
        append_runtime_log(
            &runtime.vault.root,
            "error",
            "supervisor.snapshot_failed",
            &err.to_string(),
        );
    }

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    state.services = board.snapshot();
    let _ = save_supervisor_state(paths, state);

    clear_start_lock(paths);
    let _ = fs::remove_file(paths.stop_signal_path());
    append_runtime_log(
        &runtime.vault.root,
        "info",
        "supervisor.stopped",
        &format!(
            "drained events={} cancelled={}",
            stats.delivered, stats.cancelled
        ),
    );
}
