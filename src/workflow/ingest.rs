use super::action::Action;
use super::engine::WorkflowEngine;
use super::state::WorkflowState;
use crate::audit::AuditEntryDraft;
use crate::bus::{Event, EventType};
use crate::execution::plan::Plan;
use crate::shared::errors::PipelineError;
use crate::shared::fs_atomic::{atomic_move_file, atomic_write_file};
use crate::vault::{ACTION_SUFFIX, PLAN_SUFFIX};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub stem: String,
    pub correlation_id: String,
    pub action: Action,
    pub action_path: PathBuf,
    pub archived_path: PathBuf,
}

impl WorkflowEngine {
    /// Materializes an Action from a raw ingress file: writes
    /// `<uuid>.action.yaml` into Needs_Action and archives the raw file
    /// under the same stem so provenance survives.
    pub fn ingest_inbox_file(
        &self,
        raw_path: &Path,
        source: &str,
    ) -> Result<IngestOutcome, PipelineError> {
        let content = fs::read_to_string(raw_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PipelineError::FileNotFound {
                    path: raw_path.display().to_string(),
                }
            } else {
                PipelineError::MoveFailed {
                    path: raw_path.display().to_string(),
                    source: err,
                }
            }
        })?;

        let action = Action::infer_from_text(&content, source);
        let stem = action.id.clone();
        let correlation_id = self
            .tracker()
            .create_context(&stem, WorkflowState::Inbox);

        let action_yaml = action.to_yaml().map_err(|err| PipelineError::SchemaInvalid {
            path: raw_path.display().to_string(),
            reason: err.to_string(),
        })?;
        let action_path = self.vault().file_in("Needs_Action", &stem, ACTION_SUFFIX);
        atomic_write_file(&action_path, action_yaml.as_bytes()).map_err(|source_err| {
            PipelineError::MoveFailed {
                path: action_path.display().to_string(),
                source: source_err,
            }
        })?;

        let archived_path = self
            .vault()
            .folder("Archived")
            .join(archived_name(&stem, raw_path));
        if let Err(source_err) = atomic_move_file(raw_path, &archived_path) {
            // Roll back the half-finished ingestion so the inbox file can
            // be picked up again.
            let _ = fs::remove_file(&action_path);
            return Err(PipelineError::MoveFailed {
                path: archived_path.display().to_string(),
                source: source_err,
            });
        }

        let _ = self.audit().append(
            AuditEntryDraft::new("transition.completed", "workflow_engine")
                .action("ingest")
                .resource("stem", &stem)
                .correlation(&correlation_id)
                .detail("from_state", json!(WorkflowState::Inbox))
                .detail("to_state", json!(WorkflowState::NeedsAction))
                .detail("action_type", json!(action.action_type))
                .detail("source", json!(action.source)),
        );
        self.tracker().record_transition(
            &correlation_id,
            WorkflowState::Inbox,
            WorkflowState::NeedsAction,
            true,
            "",
        );
        self.bus().publish(
            Event::new(EventType::ActionGenerated, "workflow_engine")
                .with_correlation(&correlation_id)
                .with_payload("stem", json!(stem))
                .with_payload("action_id", json!(action.id))
                .with_payload("action_type", json!(action.action_type))
                .with_payload("priority", json!(action.priority)),
        );

        Ok(IngestOutcome {
            stem,
            correlation_id,
            action,
            action_path,
            archived_path,
        })
    }

    /// Lands a generated plan: writes `<stem>.plan.md` into Plans, retires
    /// the action file to Archived, and records ACTION_PROCESSING -> PLANS.
    /// Both file mutations happen under the stem lock so the one-live-file
    /// invariant holds for concurrent observers.
    pub fn complete_planning(
        &self,
        stem: &str,
        correlation_id: &str,
        plan: &Plan,
    ) -> Result<PathBuf, PipelineError> {
        let guard = self.locks().acquire(stem, self.lock_timeout())?;

        let action_path = self.vault().file_in("Needs_Action", stem, ACTION_SUFFIX);
        if !action_path.exists() {
            return Err(PipelineError::FileNotFound {
                path: action_path.display().to_string(),
            });
        }

        let plan_path = self.vault().file_in("Plans", stem, PLAN_SUFFIX);
        if plan_path.exists() {
            return Err(PipelineError::TargetExists {
                path: plan_path.display().to_string(),
            });
        }
        let rendered = plan.render().map_err(|err| PipelineError::SchemaInvalid {
            path: plan_path.display().to_string(),
            reason: err.to_string(),
        })?;
        atomic_write_file(&plan_path, rendered.as_bytes()).map_err(|source_err| {
            PipelineError::MoveFailed {
                path: plan_path.display().to_string(),
                source: source_err,
            }
        })?;

        let archived_action = self
            .vault()
            .file_in("Archived", stem, ACTION_SUFFIX);
        if let Err(source_err) = atomic_move_file(&action_path, &archived_action) {
            let _ = fs::remove_file(&plan_path);
            return Err(PipelineError::MoveFailed {
                path: archived_action.display().to_string(),
                source: source_err,
            });
        }

        self.tracker().attach_plan(correlation_id, &plan.id);
        let _ = self.audit().append(
            AuditEntryDraft::new("transition.completed", "workflow_engine")
                .action("plan_created")
                .resource("stem", stem)
                .correlation(correlation_id)
                .detail("from_state", json!(WorkflowState::ActionProcessing))
                .detail("to_state", json!(WorkflowState::Plans))
                .detail("plan_id", json!(plan.id))
                .detail("steps", json!(plan.steps.len())),
        );
        self.tracker().record_transition(
            correlation_id,
            WorkflowState::ActionProcessing,
            WorkflowState::Plans,
            true,
            "",
        );
        self.bus().publish(
            Event::new(EventType::PlanCreated, "workflow_engine")
                .with_correlation(correlation_id)
                .with_payload("stem", json!(stem))
                .with_payload("plan_id", json!(plan.id)),
        );

        drop(guard);
        Ok(plan_path)
    }
}

fn archived_name(stem: &str, raw_path: &Path) -> String {
    match raw_path.extension().and_then(|v| v.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{stem}.{ext}"),
        _ => format!("{stem}.raw"),
    }
}
