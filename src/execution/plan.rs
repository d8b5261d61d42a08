use crate::shared::errors::PipelineError;
use crate::shared::front_matter;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::new_uuid;
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Planned,
    PendingApproval,
    Approved,
    Executed,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Email,
    Calendar,
    File,
    Api,
    Script,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Calendar => "calendar",
            Self::File => "file",
            Self::Api => "api",
            Self::Script => "script",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Step {
    pub index: usize,
    pub kind: StepKind,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rollback_params: BTreeMap<String, serde_json::Value>,
}

impl Step {
    pub fn describe(&self) -> String {
        self.params
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{} step {}", self.kind, self.index))
    }
}

/// The ordered sequence of steps that fulfils an Action, stored as
/// `<action-id>.plan.md` with YAML front matter over a prose body.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Plan {
    pub action_id: String,
    pub id: String,
    pub status: PlanStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub estimated_duration_min: u32,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub correlation_id: String,
    #[serde(skip, default)]
    pub body: String,
}

impl Plan {
    pub fn new(action_id: &str, correlation_id: &str) -> Self {
        let now = now_rfc3339();
        Self {
            action_id: action_id.to_string(),
            id: new_uuid(),
            status: PlanStatus::Draft,
            created_at: now.clone(),
            updated_at: now,
            estimated_duration_min: 0,
            requires_approval: false,
            steps: Vec::new(),
            correlation_id: correlation_id.to_string(),
            body: String::new(),
        }
    }

    /// Step indexes must be 0-based and contiguous, and rollback
    /// parameters only make sense on reversible steps.
    pub fn validate(&self) -> Result<(), String> {
        for (expected, step) in self.steps.iter().enumerate() {
            if step.index != expected {
                return Err(format!(
                    "step index {} out of order (expected {expected})",
                    step.index
                ));
            }
            if !step.reversible && !step.rollback_params.is_empty() {
                return Err(format!(
                    "step {} has rollback_params but is not reversible",
                    step.index
                ));
            }
        }
        Ok(())
    }

    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        let yaml = serde_yaml::to_string(self)?;
        let body = if self.body.is_empty() {
            default_body(self)
        } else {
            self.body.clone()
        };
        Ok(front_matter::render(&yaml, &body))
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let rendered = self.render().map_err(|err| PipelineError::SchemaInvalid {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        atomic_write_file(path, rendered.as_bytes()).map_err(|source| {
            PipelineError::MoveFailed {
                path: path.display().to_string(),
                source,
            }
        })
    }

    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path).map_err(|err| {
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
        let (yaml, body) =
            front_matter::split(&raw).ok_or_else(|| PipelineError::SchemaInvalid {
                path: path.display().to_string(),
                reason: "missing front matter".to_string(),
            })?;
        let mut plan: Plan =
            serde_yaml::from_str(yaml).map_err(|err| PipelineError::SchemaInvalid {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        plan.validate().map_err(|reason| PipelineError::SchemaInvalid {
            path: path.display().to_string(),
            reason,
        })?;
        plan.body = body.to_string();
        Ok(plan)
    }

    pub fn touch(&mut self, status: PlanStatus) {
        self.status = status;
        self.updated_at = now_rfc3339();
    }
}

fn default_body(plan: &Plan) -> String {
    let mut steps = String::new();
    for step in &plan.steps {
        steps.push_str(&format!("{}. {}\n", step.index + 1, step.describe()));
    }
    format!(
        "# Objectives\nFulfil action {}.\n\n# Steps\n{steps}\n# Resources\n\n# Success Criteria\nAll steps complete without rollback.\n",
        plan.action_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_plan() -> Plan {
        let mut plan = Plan::new("action-1", "corr-1");
        plan.steps.push(Step {
            index: 0,
            kind: StepKind::Email,
            params: BTreeMap::from([(
                "description".to_string(),
                serde_json::json!("reply to the customer"),
            )]),
            reversible: false,
            rollback_params: BTreeMap::new(),
        });
        plan.steps.push(Step {
            index: 1,
            kind: StepKind::File,
            params: BTreeMap::new(),
            reversible: true,
            rollback_params: BTreeMap::from([(
                "path".to_string(),
                serde_json::json!("/tmp/out.txt"),
            )]),
        });
        plan
    }

    #[test]
    fn plan_round_trips_through_markdown() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.plan.md");
        let plan = sample_plan();
        plan.write(&path).expect("write");

        let loaded = Plan::read(&path).expect("read");
        assert_eq!(loaded.id, plan.id);
        assert_eq!(loaded.steps, plan.steps);
        assert!(loaded.body.contains("# Objectives"));
    }

    #[test]
    fn validation_rejects_gapped_indexes() {
        let mut plan = sample_plan();
        plan.steps[1].index = 3;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validation_rejects_rollback_params_on_irreversible_steps() {
        let mut plan = sample_plan();
        plan.steps[0].rollback_params =
            BTreeMap::from([("x".to_string(), serde_json::json!(1))]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn read_rejects_schema_invalid_documents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.plan.md");
        fs::write(&path, "---\nnot: [valid plan\n---\n").expect("write");
        assert!(matches!(
            Plan::read(&path),
            Err(PipelineError::SchemaInvalid { .. })
        ));
    }
}
