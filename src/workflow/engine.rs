use super::correlation::CorrelationTracker;
use super::dead_letter::DeadLetterQueue;
use super::locking::StemLocks;
use super::retry::RetryPolicy;
use super::state::{is_valid_transition, WorkflowState};
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::bus::{Event, EventBus, EventType};
use crate::shared::errors::PipelineError;
use crate::shared::fs_atomic::atomic_move_file;
use crate::shared::logging::append_runtime_log;
use crate::vault::VaultPaths;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub stem: String,
    pub suffix: String,
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TransitionRequest {
    pub fn new(
        stem: &str,
        suffix: &str,
        from_state: WorkflowState,
        to_state: WorkflowState,
        correlation_id: &str,
    ) -> Self {
        Self {
            stem: stem.to_string(),
            suffix: suffix.to_string(),
            from_state,
            to_state,
            correlation_id: correlation_id.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn filename(&self) -> String {
        format!("{}{}", self.stem, self.suffix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub new_path: PathBuf,
    /// False when both states share a folder and the transition was
    /// recorded without a physical move.
    pub moved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    pub transitions_completed: u64,
    pub transitions_failed: u64,
    pub retries: u64,
    pub dlq_size: usize,
    pub active_correlations: usize,
}

/// The transition engine: sole writer to the pipeline folders. Owns the
/// stem locks, retry policy, dead-letter queue, and correlation tracker.
pub struct WorkflowEngine {
    vault: VaultPaths,
    bus: Arc<EventBus>,
    audit: Arc<AuditLog>,
    locks: StemLocks,
    retry: RetryPolicy,
    dlq: DeadLetterQueue,
    tracker: Arc<CorrelationTracker>,
    lock_timeout: Duration,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl WorkflowEngine {
    pub fn new(
        vault: VaultPaths,
        bus: Arc<EventBus>,
        audit: Arc<AuditLog>,
        tracker: Arc<CorrelationTracker>,
        retry: RetryPolicy,
        lock_timeout_ms: u64,
        lock_stale_ms: u64,
    ) -> Self {
        let locks = StemLocks::new(vault.locks_dir(), lock_stale_ms);
        let dlq = DeadLetterQueue::new(vault.clone());
        Self {
            vault,
            bus,
            audit,
            locks,
            retry,
            dlq,
            tracker,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        }
    }

    pub fn vault(&self) -> &VaultPaths {
        &self.vault
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub(crate) fn locks(&self) -> &StemLocks {
        &self.locks
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn tracker(&self) -> &Arc<CorrelationTracker> {
        &self.tracker
    }

    pub fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            transitions_completed: self.completed.load(Ordering::Relaxed),
            transitions_failed: self.failed.load(Ordering::Relaxed),
            retries: self.retried.load(Ordering::Relaxed),
            dlq_size: self.dlq.len(),
            active_correlations: self.tracker.open_len(),
        }
    }

    /// Validated, locked, atomic move of one stem between pipeline
    /// folders. Lock release runs on every exit path.
    pub fn transition(&self, req: &TransitionRequest) -> Result<TransitionOutcome, PipelineError> {
        let guard = match self.locks.acquire(&req.stem, self.lock_timeout) {
            Ok(guard) => guard,
            Err(err) => {
                self.note_failure(req, &err);
                return Err(err);
            }
        };
        if guard.stale_claimed {
            let _ = self.audit.append(
                AuditEntryDraft::new("lock.stale", "workflow_engine")
                    .resource("stem", &req.stem)
                    .correlation(&req.correlation_id),
            );
        }

        if !is_valid_transition(req.from_state, req.to_state) {
            let err = PipelineError::InvalidTransition {
                from: req.from_state.to_string(),
                to: req.to_state.to_string(),
            };
            let _ = self.audit.append(
                AuditEntryDraft::new("transition.invalid", "workflow_engine")
                    .action("transition")
                    .resource("stem", &req.stem)
                    .correlation(&req.correlation_id)
                    .detail("from_state", json!(req.from_state))
                    .detail("to_state", json!(req.to_state)),
            );
            self.note_failure(req, &err);
            return Err(err);
        }

        let filename = req.filename();
        let source = self.vault.folder(req.from_state.folder()).join(&filename);
        let target = self.vault.folder(req.to_state.folder()).join(&filename);

        if !source.exists() {
            let err = PipelineError::FileNotFound {
                path: source.display().to_string(),
            };
            self.audit_failure(req, &err);
            self.note_failure(req, &err);
            return Err(err);
        }

        let moved = source != target;
        if moved {
            if target.exists() {
                let err = PipelineError::TargetExists {
                    path: target.display().to_string(),
                };
                self.audit_failure(req, &err);
                self.note_failure(req, &err);
                return Err(err);
            }
            if let Err(source_err) = atomic_move_file(&source, &target) {
                let err = PipelineError::MoveFailed {
                    path: target.display().to_string(),
                    source: source_err,
                };
                self.audit_failure(req, &err);
                self.note_failure(req, &err);
                return Err(err);
            }
        }

        let mut draft = AuditEntryDraft::new("transition.completed", "workflow_engine")
            .action("transition")
            .resource("stem", &req.stem)
            .correlation(&req.correlation_id)
            .detail("from_state", json!(req.from_state))
            .detail("to_state", json!(req.to_state))
            .detail("moved", json!(moved));
        for (key, value) in &req.metadata {
            draft = draft.detail(key, value.clone());
        }
        let _ = self.audit.append(draft);

        self.publish_transition_event(req);
        self.tracker
            .record_transition(&req.correlation_id, req.from_state, req.to_state, true, "");
        self.completed.fetch_add(1, Ordering::Relaxed);
        append_runtime_log(
            &self.vault.root,
            "info",
            "transition.completed",
            &format!(
                "stem={} {} -> {}",
                req.stem, req.from_state, req.to_state
            ),
        );

        drop(guard);
        Ok(TransitionOutcome {
            new_path: target,
            moved,
        })
    }

    /// Transition with backoff. Retryable failures are reattempted up to
    /// the policy's budget; exhaustion quarantines the file in the DLQ.
    /// Non-retryable failures surface immediately. The stop flag cancels
    /// between attempts.
    pub fn transition_with_retry(
        &self,
        req: &TransitionRequest,
        stop: &AtomicBool,
    ) -> Result<TransitionOutcome, PipelineError> {
        let mut attempt = 0u32;
        loop {
            match self.transition(req) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if self.retry.should_retry(attempt, &err) && !stop.load(Ordering::Relaxed) {
                        let delay = self.retry.delay_for_attempt(attempt);
                        append_runtime_log(
                            &self.vault.root,
                            "warn",
                            "transition.retry",
                            &format!(
                                "stem={} attempt={} delay_ms={} error={err}",
                                req.stem,
                                attempt + 1,
                                delay.as_millis()
                            ),
                        );
                        self.retried.fetch_add(1, Ordering::Relaxed);
                        self.tracker.record_retry(&req.correlation_id);
                        if !sleep_unless_stopped(stop, delay) {
                            return Err(err);
                        }
                        attempt += 1;
                        continue;
                    }
                    if err.is_retryable() {
                        // Retry budget exhausted: quarantine.
                        self.dead_letter(req, &err, attempt + 1);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Quarantines a stem outside the retry path (e.g. a failed rollback).
    pub fn quarantine(
        &self,
        stem: &str,
        suffix: &str,
        from_state: WorkflowState,
        correlation_id: &str,
        err: &PipelineError,
        attempts: u32,
    ) {
        let req = TransitionRequest::new(stem, suffix, from_state, WorkflowState::DeadLetter, correlation_id);
        self.dead_letter(&req, err, attempts);
    }

    fn dead_letter(&self, req: &TransitionRequest, err: &PipelineError, attempts: u32) {
        let context = self
            .tracker
            .get(&req.correlation_id)
            .map(|c| serde_json::to_value(&c).unwrap_or(serde_json::Value::Null))
            .unwrap_or(serde_json::Value::Null);
        match self.dlq.admit(
            &req.filename(),
            req.from_state,
            &err.to_string(),
            attempts,
            &req.correlation_id,
            context,
        ) {
            Ok(meta) => {
                let _ = self.audit.append(
                    AuditEntryDraft::new("dlq.admitted", "workflow_engine")
                        .action("dead_letter")
                        .resource("stem", &req.stem)
                        .correlation(&req.correlation_id)
                        .detail("dlq_id", json!(meta.dlq_id))
                        .detail("error", json!(err.to_string()))
                        .detail("attempts", json!(attempts)),
                );
                self.tracker.record_transition(
                    &req.correlation_id,
                    req.from_state,
                    WorkflowState::DeadLetter,
                    true,
                    &err.to_string(),
                );
                self.bus.publish(
                    Event::new(EventType::ActionFailed, "workflow_engine")
                        .with_correlation(&req.correlation_id)
                        .with_payload("stem", json!(req.stem))
                        .with_payload("error", json!(err.to_string()))
                        .with_payload("error_kind", json!(err.kind()))
                        .with_payload("terminal", json!(true)),
                );
            }
            Err(dlq_err) => {
                append_runtime_log(
                    &self.vault.root,
                    "error",
                    "dlq.admit.failed",
                    &format!("stem={} error={dlq_err}", req.stem),
                );
            }
        }
    }

    fn audit_failure(&self, req: &TransitionRequest, err: &PipelineError) {
        let _ = self.audit.append(
            AuditEntryDraft::new("transition.failed", "workflow_engine")
                .action("transition")
                .resource("stem", &req.stem)
                .correlation(&req.correlation_id)
                .detail("from_state", json!(req.from_state))
                .detail("to_state", json!(req.to_state))
                .detail("error_kind", json!(err.kind()))
                .detail("error", json!(err.to_string())),
        );
    }

    fn note_failure(&self, req: &TransitionRequest, err: &PipelineError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.tracker.record_transition(
            &req.correlation_id,
            req.from_state,
            req.to_state,
            false,
            &err.to_string(),
        );
    }

    fn publish_transition_event(&self, req: &TransitionRequest) {
        let (event_type, terminal) = map_transition_event(req.from_state, req.to_state);
        let mut event = Event::new(event_type, "workflow_engine")
            .with_correlation(&req.correlation_id)
            .with_payload("stem", json!(req.stem))
            .with_payload("from_state", json!(req.from_state))
            .with_payload("to_state", json!(req.to_state));
        if terminal {
            event = event.with_payload("terminal", json!(true));
        }
        for (key, value) in &req.metadata {
            event = event.with_payload(key, value.clone());
        }
        self.bus.publish(event);
    }
}

/// Folder-transition to event-type mapping.
pub fn map_transition_event(from: WorkflowState, to: WorkflowState) -> (EventType, bool) {
    use WorkflowState::*;
    match (from, to) {
        (Inbox, NeedsAction) => (EventType::ActionGenerated, false),
        (NeedsAction | ActionProcessing, Plans) => (EventType::PlanCreated, false),
        (Plans, PendingApproval) => (EventType::ApprovalRequired, false),
        (PendingApproval | ApprovalReview, Approved) => (EventType::ActionApproved, false),
        (Executing, Executed) => (EventType::ActionExecuted, false),
        (Executed | Executing, Done) => (EventType::PlanExecutionCompleted, false),
        (_, Failed) => (EventType::ActionFailed, false),
        (_, DeadLetter) => (EventType::ActionFailed, true),
        _ => (EventType::ActionProcessed, false),
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(200));
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
