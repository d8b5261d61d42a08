use super::planner::Planner;
use crate::approval::{ApprovalContext, ApprovalDecision, ApprovalRecord, ApprovalRuleEngine};
use crate::audit::AuditEntryDraft;
use crate::bus::{Event, EventType};
use crate::execution::{ExecutionEngine, Plan, PlanStatus, RunStatus};
use crate::shared::errors::PipelineError;
use crate::shared::fs_atomic::atomic_move_file;
use crate::shared::logging::append_runtime_log;
use crate::vault::{ACTION_SUFFIX, APPROVAL_SUFFIX, PLAN_SUFFIX};
use crate::workflow::{
    Action, TransitionRequest, WorkflowEngine, WorkflowState,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Drives actions through the pipeline in response to bus events:
/// ingestion, plan generation, approval routing, and execution.
pub struct PipelineWorker {
    engine: Arc<WorkflowEngine>,
    execution: Arc<ExecutionEngine>,
    approvals: Arc<ApprovalRuleEngine>,
    planner: Arc<dyn Planner>,
    stop: Arc<AtomicBool>,
}

impl PipelineWorker {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        execution: Arc<ExecutionEngine>,
        approvals: Arc<ApprovalRuleEngine>,
        planner: Arc<dyn Planner>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            execution,
            approvals,
            planner,
            stop,
        }
    }

    /// Bus entry point. Errors bubble up as strings so the bus can log
    /// and isolate them without tearing the subscriber down.
    pub fn handle_event(&self, event: &Event) -> Result<(), String> {
        match event.event_type {
            EventType::FileCreated => {
                let folder = event
                    .payload
                    .get("folder")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let path = event
                    .payload
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match folder {
                    "Inbox" => self
                        .engine
                        .ingest_inbox_file(Path::new(path), "file_watcher")
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    "Approved" => {
                        let stem = event
                            .payload
                            .get("stem")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        self.handle_human_approval(stem).map_err(|e| e.to_string())
                    }
                    _ => Ok(()),
                }
            }
            EventType::ActionGenerated => {
                let stem = event
                    .payload
                    .get("stem")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let correlation_id = event.correlation_id.clone().unwrap_or_default();
                self.process_action(stem, &correlation_id)
                    .map_err(|e| e.to_string())
            }
            EventType::ActionApproved => {
                let stem = event
                    .payload
                    .get("stem")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.execute_stem(stem).map_err(|e| e.to_string())
            }
            _ => Ok(()),
        }
    }

    /// Needs_Action -> Plans -> (Pending_Approval | Approved), then
    /// execution for the auto-approved path.
    pub fn process_action(&self, stem: &str, correlation_id: &str) -> Result<(), PipelineError> {
        let action_path = self.engine.vault().file_in("Needs_Action", stem, ACTION_SUFFIX);
        let action = match read_action(&action_path) {
            Ok(action) => action,
            Err(err) => {
                // Schema-invalid input is not retryable; park it in Failed.
                let req = TransitionRequest::new(
                    stem,
                    ACTION_SUFFIX,
                    WorkflowState::NeedsAction,
                    WorkflowState::Failed,
                    correlation_id,
                );
                let _ = self.engine.transition(&req);
                return Err(err);
            }
        };

        let req = TransitionRequest::new(
            stem,
            ACTION_SUFFIX,
            WorkflowState::NeedsAction,
            WorkflowState::ActionProcessing,
            correlation_id,
        );
        self.engine.transition_with_retry(&req, &self.stop)?;

        let mut plan = match self.planner.generate(&action, correlation_id) {
            Ok(plan) => plan,
            Err(err) => {
                let req = TransitionRequest::new(
                    stem,
                    ACTION_SUFFIX,
                    WorkflowState::ActionProcessing,
                    WorkflowState::Failed,
                    correlation_id,
                );
                let _ = self.engine.transition_with_retry(&req, &self.stop);
                return Err(err);
            }
        };

        let evaluation = self
            .approvals
            .evaluate(&ApprovalContext::for_action(&action, &plan.id));
        plan.requires_approval = matches!(
            evaluation.decision,
            ApprovalDecision::RequireApproval | ApprovalDecision::Escalate
        );
        plan.estimated_duration_min = action.estimated_duration_min.unwrap_or(plan.estimated_duration_min);
        plan.touch(if plan.requires_approval {
            PlanStatus::PendingApproval
        } else {
            PlanStatus::Approved
        });

        self.engine.complete_planning(stem, correlation_id, &plan)?;

        let audit_type = match evaluation.decision {
            ApprovalDecision::AutoApprove => "approval.auto_approve",
            ApprovalDecision::RequireApproval => "approval.required",
            ApprovalDecision::AutoReject => "approval.auto_reject",
            ApprovalDecision::Escalate => "approval.escalate",
        };
        let _ = self.engine.audit().append(
            AuditEntryDraft::new(audit_type, "approval_rule_engine")
                .action("evaluate")
                .resource("plan", &plan.id)
                .correlation(correlation_id)
                .detail("risk_level", json!(evaluation.risk_level))
                .detail("risk_score", json!(evaluation.risk_score))
                .detail("matched_rule_id", json!(evaluation.matched_rule_id))
                .detail("reason", json!(evaluation.reason)),
        );

        match evaluation.decision {
            ApprovalDecision::AutoApprove => {
                let req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Plans,
                    WorkflowState::ExecutionPending,
                    correlation_id,
                );
                self.engine.transition_with_retry(&req, &self.stop)?;
                self.execute_stem(stem)
            }
            ApprovalDecision::RequireApproval | ApprovalDecision::Escalate => {
                let record = ApprovalRecord::new(
                    stem,
                    &plan.id,
                    evaluation.decision,
                    evaluation.risk_level,
                    &evaluation.reason,
                    evaluation.matched_rule_id.clone(),
                    evaluation.approvers.clone(),
                );
                let record_path =
                    self.engine
                        .vault()
                        .file_in("Pending_Approval", stem, APPROVAL_SUFFIX);
                record.write(&record_path)?;
                self.engine
                    .tracker()
                    .attach_approval(correlation_id, &record.id);

                let req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Plans,
                    WorkflowState::PendingApproval,
                    correlation_id,
                );
                self.engine.transition_with_retry(&req, &self.stop)?;
                Ok(())
            }
            ApprovalDecision::AutoReject => {
                let mut req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Plans,
                    WorkflowState::Failed,
                    correlation_id,
                );
                req.metadata
                    .insert("decision".to_string(), json!("auto_reject"));
                self.engine.transition_with_retry(&req, &self.stop)?;
                self.engine.bus().publish(
                    Event::new(EventType::ApprovalDenied, "approval_rule_engine")
                        .with_correlation(correlation_id)
                        .with_payload("stem", json!(stem))
                        .with_payload("reason", json!(evaluation.reason)),
                );
                Ok(())
            }
        }
    }

    /// A plan appeared in Approved while its context was still waiting:
    /// the human moved the file. Record the review transitions, resolve
    /// the approval record, and execute.
    pub fn handle_human_approval(&self, stem: &str) -> Result<(), PipelineError> {
        let Some(context) = self.engine.tracker().by_action_id(stem) else {
            return Ok(());
        };
        if !matches!(
            context.current_state,
            WorkflowState::PendingApproval | WorkflowState::ApprovalReview
        ) {
            return Ok(());
        }
        let correlation_id = context.correlation_id.clone();

        for (from, to) in [
            (WorkflowState::PendingApproval, WorkflowState::ApprovalReview),
            (WorkflowState::ApprovalReview, WorkflowState::Approved),
        ] {
            let _ = self.engine.audit().append(
                AuditEntryDraft::new("transition.completed", "workflow_engine")
                    .action("transition")
                    .resource("stem", stem)
                    .correlation(&correlation_id)
                    .detail("from_state", json!(from))
                    .detail("to_state", json!(to))
                    .detail("moved_by", json!("human")),
            );
            self.engine
                .tracker()
                .record_transition(&correlation_id, from, to, true, "");
        }
        self.resolve_approval_record(stem, "human")?;
        self.engine.bus().publish(
            Event::new(EventType::ActionApproved, "workflow_engine")
                .with_correlation(&correlation_id)
                .with_payload("stem", json!(stem))
                .with_payload("moved_by", json!("human")),
        );
        self.execute_stem(stem)
    }

    /// Runs the plan for a stem resting in Approved and lands the file in
    /// its terminal folder.
    pub fn execute_stem(&self, stem: &str) -> Result<(), PipelineError> {
        let context = self.engine.tracker().by_action_id(stem);
        let correlation_id = context
            .as_ref()
            .map(|c| c.correlation_id.clone())
            .unwrap_or_default();
        let current = context
            .map(|c| c.current_state)
            .unwrap_or(WorkflowState::Approved);

        // A stem is only runnable from the approved states; anything else
        // means another handler already picked it up (or it finished).
        let from_state = match current {
            WorkflowState::ExecutionPending => WorkflowState::ExecutionPending,
            WorkflowState::Approved => WorkflowState::Approved,
            _ => return Ok(()),
        };
        let req = TransitionRequest::new(
            stem,
            PLAN_SUFFIX,
            from_state,
            WorkflowState::Executing,
            &correlation_id,
        );
        self.engine.transition_with_retry(&req, &self.stop)?;

        let plan_path = self.engine.vault().file_in("Approved", stem, PLAN_SUFFIX);
        let plan = Plan::read(&plan_path)?;
        let report = self
            .execution
            .execute_plan(&plan, &correlation_id, &self.stop);

        match report.status {
            RunStatus::Succeeded => {
                let req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Executing,
                    WorkflowState::Executed,
                    &correlation_id,
                );
                self.engine.transition_with_retry(&req, &self.stop)?;
                let req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Executed,
                    WorkflowState::Done,
                    &correlation_id,
                );
                self.engine.transition_with_retry(&req, &self.stop)?;
                self.resolve_approval_record(stem, "system")?;
                Ok(())
            }
            RunStatus::Compensated => {
                let mut req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Executing,
                    WorkflowState::Failed,
                    &correlation_id,
                );
                req.metadata
                    .insert("compensated".to_string(), json!(true));
                self.engine.transition_with_retry(&req, &self.stop)?;
                Ok(())
            }
            RunStatus::Failed => {
                let mut req = TransitionRequest::new(
                    stem,
                    PLAN_SUFFIX,
                    WorkflowState::Executing,
                    WorkflowState::Failed,
                    &correlation_id,
                );
                req.metadata
                    .insert("rollback_failed".to_string(), json!(report.rollback_failed));
                self.engine.transition_with_retry(&req, &self.stop)?;
                if report.rollback_failed {
                    let err = PipelineError::RollbackFailed {
                        index: 0,
                        reason: "compensation failed during unwind".to_string(),
                    };
                    self.engine.quarantine(
                        stem,
                        PLAN_SUFFIX,
                        WorkflowState::Failed,
                        &correlation_id,
                        &err,
                        1,
                    );
                }
                Ok(())
            }
            RunStatus::ManualHold => {
                append_runtime_log(
                    &self.engine.vault().root,
                    "warn",
                    "execution.manual_hold",
                    &format!("stem={stem} awaiting operator instruction"),
                );
                Ok(())
            }
        }
    }

    /// Moves a resolved approval record out of Pending_Approval into
    /// Archived. Absent records (auto-approved runs) are fine.
    fn resolve_approval_record(&self, stem: &str, approver: &str) -> Result<(), PipelineError> {
        let record_path = self
            .engine
            .vault()
            .file_in("Pending_Approval", stem, APPROVAL_SUFFIX);
        if !record_path.exists() {
            return Ok(());
        }
        let mut record = ApprovalRecord::read(&record_path)?;
        if !record.is_resolved() {
            record.resolve(approver);
        }
        record.write(&record_path)?;
        let archived = self.engine.vault().file_in("Archived", stem, APPROVAL_SUFFIX);
        atomic_move_file(&record_path, &archived).map_err(|source| PipelineError::MoveFailed {
            path: archived.display().to_string(),
            source,
        })?;
        let _ = self.engine.audit().append(
            AuditEntryDraft::new("approval.granted", "workflow_engine")
                .action("resolve")
                .resource("approval", &record.id)
                .correlation(&self
                    .engine
                    .tracker()
                    .by_action_id(stem)
                    .map(|c| c.correlation_id)
                    .unwrap_or_default())
                .detail("approver", json!(approver)),
        );
        Ok(())
    }
}

fn read_action(path: &Path) -> Result<Action, PipelineError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            PipelineError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            PipelineError::MoveFailed {
                path: path.display().to_string(),
                source: err,
            }
        }
    })?;
    Action::from_yaml(&raw).map_err(|err| PipelineError::SchemaInvalid {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}
