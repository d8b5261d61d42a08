use crate::execution::{Plan, PlanStatus, Step, StepKind};
use crate::shared::errors::PipelineError;
use crate::workflow::{Action, ActionType};
use serde_json::json;
use std::collections::BTreeMap;

/// Seam to the plan-producing adapter (normally an LLM integration).
pub trait Planner: Send + Sync {
    fn generate(&self, action: &Action, correlation_id: &str) -> Result<Plan, PipelineError>;
}

/// Built-in fallback planner: one step derived from the action type, so
/// the pipeline is complete without any external adapter attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplatePlanner;

impl Planner for TemplatePlanner {
    fn generate(&self, action: &Action, correlation_id: &str) -> Result<Plan, PipelineError> {
        let mut plan = Plan::new(&action.id, correlation_id);
        plan.estimated_duration_min = action.estimated_duration_min.unwrap_or(15);
        plan.steps.push(Step {
            index: 0,
            kind: step_kind_for(action.action_type),
            params: BTreeMap::from([(
                "description".to_string(),
                json!(format!("handle {} action {}", action.action_type, action.id)),
            )]),
            reversible: false,
            rollback_params: BTreeMap::new(),
        });
        plan.touch(PlanStatus::Planned);
        Ok(plan)
    }
}

fn step_kind_for(action_type: ActionType) -> StepKind {
    match action_type {
        ActionType::EmailResponse | ActionType::FollowUp => StepKind::Email,
        ActionType::MeetingRequest => StepKind::Calendar,
        ActionType::DocumentCreation | ActionType::ReportGeneration => StepKind::File,
        ActionType::DataAnalysis => StepKind::Script,
        ActionType::Other => StepKind::Api,
    }
}
