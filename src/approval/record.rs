use super::risk::RiskLevel;
use super::rules::ApprovalDecision;
use crate::shared::errors::PipelineError;
use crate::shared::front_matter;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::new_uuid;
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Persistent record of one approval decision, stored as
/// `<action-id>.approval.md` beside the plan it gates.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ApprovalRecord {
    pub id: String,
    pub action_id: String,
    pub plan_id: String,
    pub decision: ApprovalDecision,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub matched_rule_id: Option<String>,
    /// Advisory only: no routing mechanism exists for approver lists.
    #[serde(default)]
    pub approvers: Vec<String>,
    pub requested_at: String,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub approver: Option<String>,
}

impl ApprovalRecord {
    pub fn new(
        action_id: &str,
        plan_id: &str,
        decision: ApprovalDecision,
        risk_level: RiskLevel,
        reason: &str,
        matched_rule_id: Option<String>,
        approvers: Vec<String>,
    ) -> Self {
        Self {
            id: new_uuid(),
            action_id: action_id.to_string(),
            plan_id: plan_id.to_string(),
            decision,
            risk_level,
            reason: reason.to_string(),
            matched_rule_id,
            approvers,
            requested_at: now_rfc3339(),
            resolved_at: None,
            approver: None,
        }
    }

    pub fn resolve(&mut self, approver: &str) {
        self.resolved_at = Some(now_rfc3339());
        self.approver = Some(approver.to_string());
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        let yaml = serde_yaml::to_string(self)?;
        let body = format!(
            "# Approval\n\n- decision: {}\n- risk: {}\n- reason: {}\n",
            self.decision, self.risk_level, self.reason
        );
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
        let (yaml, _body) =
            front_matter::split(&raw).ok_or_else(|| PipelineError::SchemaInvalid {
                path: path.display().to_string(),
                reason: "missing front matter".to_string(),
            })?;
        serde_yaml::from_str(yaml).map_err(|err| PipelineError::SchemaInvalid {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_round_trips_through_markdown() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("abc.approval.md");

        let mut record = ApprovalRecord::new(
            "action-1",
            "plan-1",
            ApprovalDecision::RequireApproval,
            RiskLevel::High,
            "matched rule: High risk requires approval",
            Some("high-risk".to_string()),
            Vec::new(),
        );
        record.write(&path).expect("write");

        let loaded = ApprovalRecord::read(&path).expect("read");
        assert_eq!(loaded, record);
        assert!(!loaded.is_resolved());

        record.resolve("operator");
        record.write(&path).expect("rewrite");
        let resolved = ApprovalRecord::read(&path).expect("read resolved");
        assert_eq!(resolved.approver.as_deref(), Some("operator"));
        assert!(resolved.is_resolved());
    }

    #[test]
    fn read_rejects_files_without_front_matter() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.approval.md");
        fs::write(&path, "just text").expect("write");
        let err = ApprovalRecord::read(&path).expect_err("must fail");
        assert!(matches!(err, PipelineError::SchemaInvalid { .. }));
    }
}
