use super::adapter::{AdapterRegistry, StepOutcome};
use super::plan::{Plan, Step};
use super::rollback::{RollbackEntry, RollbackStack, RollbackStrategy};
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::shared::errors::PipelineError;
use crate::shared::logging::append_runtime_log;
use crate::workflow::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Log intents only; no side effects.
    #[default]
    DryRun,
    /// Invoke the registered step adapters.
    Real,
    /// Sleep per step and report success.
    Simulated,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "DRY_RUN",
            Self::Real => "REAL",
            Self::Simulated => "SIMULATED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DRY_RUN" => Some(Self::DryRun),
            "REAL" => Some(Self::Real),
            "SIMULATED" => Some(Self::Simulated),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StepResult {
    pub index: usize,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_token: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded.
    Succeeded,
    /// A step failed and every owed compensation ran.
    Compensated,
    /// A step failed and compensation was skipped or itself failed.
    Failed,
    /// A step failed under MANUAL strategy; the stack is preserved.
    ManualHold,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
            Self::ManualHold => "manual_hold",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub action_id: String,
    pub correlation_id: String,
    pub mode: ExecutionMode,
    pub strategy: RollbackStrategy,
    pub status: RunStatus,
    pub total_steps: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_rolled_back: usize,
    pub rollback_performed: bool,
    pub rollback_failed: bool,
    pub step_results: Vec<StepResult>,
    /// Compensations still owed after a MANUAL hold.
    pub pending_rollback: RollbackStack,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetrics {
    pub plans_executed: u64,
    pub plans_failed: u64,
    pub rollbacks_performed: u64,
}

/// Runs approved plans step by step with per-step timeout, retry with
/// backoff, and a LIFO compensation stack.
pub struct ExecutionEngine {
    mode: ExecutionMode,
    strategy: RollbackStrategy,
    step_timeout: Duration,
    retry: RetryPolicy,
    registry: AdapterRegistry,
    audit: Arc<AuditLog>,
    vault_root: PathBuf,
    plans_executed: AtomicU64,
    plans_failed: AtomicU64,
    rollbacks_performed: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(
        mode: ExecutionMode,
        strategy: RollbackStrategy,
        step_timeout_ms: u64,
        retry: RetryPolicy,
        registry: AdapterRegistry,
        audit: Arc<AuditLog>,
        vault_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mode,
            strategy,
            step_timeout: Duration::from_millis(step_timeout_ms),
            retry,
            registry,
            audit,
            vault_root: vault_root.into(),
            plans_executed: AtomicU64::new(0),
            plans_failed: AtomicU64::new(0),
            rollbacks_performed: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        ExecutionMetrics {
            plans_executed: self.plans_executed.load(Ordering::Relaxed),
            plans_failed: self.plans_failed.load(Ordering::Relaxed),
            rollbacks_performed: self.rollbacks_performed.load(Ordering::Relaxed),
        }
    }

    pub fn execute_plan(
        &self,
        plan: &Plan,
        correlation_id: &str,
        stop: &AtomicBool,
    ) -> ExecutionReport {
        let mut report = ExecutionReport {
            plan_id: plan.id.clone(),
            action_id: plan.action_id.clone(),
            correlation_id: correlation_id.to_string(),
            mode: self.mode,
            strategy: self.strategy,
            status: RunStatus::Succeeded,
            total_steps: plan.steps.len(),
            steps_completed: 0,
            steps_failed: 0,
            steps_rolled_back: 0,
            rollback_performed: false,
            rollback_failed: false,
            step_results: Vec::new(),
            pending_rollback: RollbackStack::default(),
        };
        let _ = self.audit.append(
            AuditEntryDraft::new("execution.started", "execution_engine")
                .action("execute_plan")
                .resource("plan", &plan.id)
                .correlation(correlation_id)
                .detail("mode", json!(self.mode.as_str()))
                .detail("total_steps", json!(plan.steps.len())),
        );

        let mut stack = RollbackStack::default();
        let mut failed_step: Option<(usize, String)> = None;

        for step in &plan.steps {
            match self.run_step_with_retry(step, correlation_id, stop) {
                Ok((outcome, result)) => {
                    if self.mode != ExecutionMode::DryRun {
                        stack.push(RollbackEntry {
                            step_index: step.index,
                            reversible: step.reversible,
                            token: outcome.rollback_token,
                        });
                    }
                    report.steps_completed += 1;
                    report.step_results.push(result);
                }
                Err((err, result)) => {
                    report.steps_failed += 1;
                    report.step_results.push(result);
                    failed_step = Some((step.index, err.to_string()));
                    break;
                }
            }
        }

        if let Some((index, error)) = failed_step {
            match self.strategy {
                RollbackStrategy::Automatic => {
                    let (rolled_back, failed) =
                        self.unwind(&mut stack, plan, correlation_id, &mut report.step_results);
                    report.rollback_performed = true;
                    report.steps_rolled_back = rolled_back;
                    report.rollback_failed = failed;
                    report.status = if failed {
                        RunStatus::Failed
                    } else {
                        RunStatus::Compensated
                    };
                    self.rollbacks_performed.fetch_add(1, Ordering::Relaxed);
                }
                RollbackStrategy::Manual => {
                    report.status = RunStatus::ManualHold;
                    report.pending_rollback = stack;
                    let _ = self.audit.append(
                        AuditEntryDraft::new("execution.manual_hold", "execution_engine")
                            .resource("plan", &plan.id)
                            .correlation(correlation_id)
                            .detail("failed_step", json!(index))
                            .detail("error", json!(error)),
                    );
                }
                RollbackStrategy::None => {
                    report.status = RunStatus::Failed;
                }
            }
            self.plans_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            report.status = RunStatus::Succeeded;
            self.plans_executed.fetch_add(1, Ordering::Relaxed);
        }

        let mut completed = AuditEntryDraft::new("execution.completed", "execution_engine")
            .action("execute_plan")
            .resource("plan", &plan.id)
            .correlation(correlation_id)
            .detail("status", json!(report.status.as_str()))
            .detail("mode", json!(self.mode.as_str()))
            .detail("steps_completed", json!(report.steps_completed))
            .detail("steps_failed", json!(report.steps_failed))
            .detail("steps_rolled_back", json!(report.steps_rolled_back));
        if report.status == RunStatus::Compensated {
            completed = completed.detail("compensated", json!(true));
        }
        let _ = self.audit.append(completed);

        report
    }

    fn run_step_with_retry(
        &self,
        step: &Step,
        correlation_id: &str,
        stop: &AtomicBool,
    ) -> Result<(StepOutcome, StepResult), (PipelineError, StepResult)> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let outcome = self.run_step_once(step);
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(outcome) => {
                    let _ = self.audit.append(
                        AuditEntryDraft::new("step.succeeded", "execution_engine")
                            .resource("step", &step.index.to_string())
                            .correlation(correlation_id)
                            .detail("duration_ms", json!(duration_ms))
                            .detail("attempt", json!(attempt + 1))
                            .detail("kind", json!(step.kind.as_str()))
                            .detail("detail", json!(outcome.detail)),
                    );
                    let result = StepResult {
                        index: step.index,
                        status: StepStatus::Succeeded,
                        duration_ms,
                        attempts: attempt + 1,
                        error: None,
                        rollback_token: outcome.rollback_token.clone(),
                    };
                    return Ok((outcome, result));
                }
                Err(err) => {
                    let _ = self.audit.append(
                        AuditEntryDraft::new("step.failed", "execution_engine")
                            .resource("step", &step.index.to_string())
                            .correlation(correlation_id)
                            .detail("duration_ms", json!(duration_ms))
                            .detail("attempt", json!(attempt + 1))
                            .detail("error_kind", json!(err.kind()))
                            .detail("error", json!(err.to_string())),
                    );
                    if self.retry.should_retry(attempt, &err) && !stop.load(Ordering::Relaxed) {
                        let delay = self.retry.delay_for_attempt(attempt);
                        append_runtime_log(
                            &self.vault_root,
                            "warn",
                            "step.retry",
                            &format!(
                                "step={} attempt={} delay_ms={}",
                                step.index,
                                attempt + 1,
                                delay.as_millis()
                            ),
                        );
                        if !sleep_with_stop(stop, delay) {
                            let result = StepResult {
                                index: step.index,
                                status: StepStatus::Failed,
                                duration_ms,
                                attempts: attempt + 1,
                                error: Some(err.to_string()),
                                rollback_token: None,
                            };
                            return Err((err, result));
                        }
                        attempt += 1;
                        continue;
                    }
                    let result = StepResult {
                        index: step.index,
                        status: StepStatus::Failed,
                        duration_ms,
                        attempts: attempt + 1,
                        error: Some(err.to_string()),
                        rollback_token: None,
                    };
                    return Err((err, result));
                }
            }
        }
    }

    fn run_step_once(&self, step: &Step) -> Result<StepOutcome, PipelineError> {
        match self.mode {
            ExecutionMode::DryRun => {
                let intent = format!("WOULD EXECUTE: {}", step.describe());
                append_runtime_log(&self.vault_root, "info", "execution.dry_run", &intent);
                Ok(StepOutcome {
                    detail: intent,
                    rollback_token: None,
                })
            }
            ExecutionMode::Simulated => {
                let millis = step
                    .params
                    .get("simulated_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(100);
                thread::sleep(Duration::from_millis(millis));
                Ok(StepOutcome {
                    detail: format!("simulated {}", step.describe()),
                    rollback_token: step.reversible.then(|| json!({"simulated": true})),
                })
            }
            ExecutionMode::Real => {
                let adapter =
                    self.registry
                        .get(step.kind)
                        .ok_or_else(|| PipelineError::StepFailed {
                            index: step.index,
                            reason: format!("no adapter registered for kind {}", step.kind),
                            fatal: true,
                        })?;
                let (tx, rx) = mpsc::channel();
                let step_clone = step.clone();
                thread::spawn(move || {
                    let _ = tx.send(adapter.execute(&step_clone));
                });
                match rx.recv_timeout(self.step_timeout) {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::StepTimeout {
                        index: step.index,
                        deadline_ms: self.step_timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// Pops the compensation stack in reverse order. Non-reversible
    /// entries are recorded and skipped; a failing compensation marks the
    /// run but unwinding continues.
    fn unwind(
        &self,
        stack: &mut RollbackStack,
        plan: &Plan,
        correlation_id: &str,
        step_results: &mut [StepResult],
    ) -> (usize, bool) {
        let mut rolled_back = 0usize;
        let mut any_failed = false;
        while let Some(entry) = stack.pop() {
            if !entry.reversible {
                let _ = self.audit.append(
                    AuditEntryDraft::new("rollback.not_supported", "execution_engine")
                        .resource("step", &entry.step_index.to_string())
                        .correlation(correlation_id),
                );
                continue;
            }

            let result = match self.mode {
                ExecutionMode::Real => {
                    let step = plan.steps.iter().find(|s| s.index == entry.step_index);
                    match (step, entry.token.as_ref()) {
                        (Some(step), Some(token)) => self
                            .registry
                            .get(step.kind)
                            .ok_or_else(|| PipelineError::RollbackFailed {
                                index: entry.step_index,
                                reason: "adapter missing at rollback".to_string(),
                            })
                            .and_then(|adapter| adapter.rollback(step, token)),
                        _ => Err(PipelineError::RollbackFailed {
                            index: entry.step_index,
                            reason: "no rollback token recorded".to_string(),
                        }),
                    }
                }
                ExecutionMode::Simulated | ExecutionMode::DryRun => Ok(()),
            };

            match result {
                Ok(()) => {
                    rolled_back += 1;
                    if let Some(step_result) = step_results
                        .iter_mut()
                        .find(|r| r.index == entry.step_index)
                    {
                        step_result.status = StepStatus::RolledBack;
                    }
                    let _ = self.audit.append(
                        AuditEntryDraft::new("rollback.completed", "execution_engine")
                            .resource("step", &entry.step_index.to_string())
                            .correlation(correlation_id),
                    );
                }
                Err(err) => {
                    any_failed = true;
                    let _ = self.audit.append(
                        AuditEntryDraft::new("rollback.failed", "execution_engine")
                            .resource("step", &entry.step_index.to_string())
                            .correlation(correlation_id)
                            .detail("error", json!(err.to_string())),
                    );
                }
            }
        }
        (rolled_back, any_failed)
    }
}

fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(200));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
