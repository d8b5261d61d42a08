use super::risk::RiskLevel;
use crate::workflow::ActionType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    AutoApprove,
    RequireApproval,
    AutoReject,
    Escalate,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve",
            Self::RequireApproval => "require_approval",
            Self::AutoReject => "auto_reject",
            Self::Escalate => "escalate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto_approve" => Some(Self::AutoApprove),
            "require_approval" => Some(Self::RequireApproval),
            "auto_reject" => Some(Self::AutoReject),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered approval rule. Empty `action_types` matches every type;
/// absent bounds are open. A rule matches only when every present
/// predicate holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRule {
    pub rule_id: String,
    pub name: String,
    /// Lower value evaluates first.
    pub priority: i32,
    pub action_types: Vec<ActionType>,
    pub min_risk_level: Option<RiskLevel>,
    pub max_risk_level: Option<RiskLevel>,
    pub min_duration_min: Option<u32>,
    pub max_duration_min: Option<u32>,
    pub decision: ApprovalDecision,
    pub approvers: Vec<String>,
    pub enabled: bool,
}

impl ApprovalRule {
    pub fn matches(
        &self,
        action_type: ActionType,
        risk_level: RiskLevel,
        estimated_duration_min: u32,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.action_types.is_empty() && !self.action_types.contains(&action_type) {
            return false;
        }
        if let Some(min) = self.min_risk_level {
            if risk_level < min {
                return false;
            }
        }
        if let Some(max) = self.max_risk_level {
            if risk_level > max {
                return false;
            }
        }
        if let Some(min) = self.min_duration_min {
            if estimated_duration_min < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration_min {
            if estimated_duration_min > max {
                return false;
            }
        }
        true
    }
}

/// Built-in rule set, ascending priority.
pub fn default_rules() -> Vec<ApprovalRule> {
    vec![
        ApprovalRule {
            rule_id: "critical-escalate".to_string(),
            name: "Critical risk escalation".to_string(),
            priority: 1,
            action_types: Vec::new(),
            min_risk_level: Some(RiskLevel::Critical),
            max_risk_level: None,
            min_duration_min: None,
            max_duration_min: None,
            decision: ApprovalDecision::Escalate,
            approvers: vec!["admin".to_string()],
            enabled: true,
        },
        ApprovalRule {
            rule_id: "high-risk".to_string(),
            name: "High risk requires approval".to_string(),
            priority: 2,
            action_types: Vec::new(),
            min_risk_level: Some(RiskLevel::High),
            max_risk_level: None,
            min_duration_min: None,
            max_duration_min: None,
            decision: ApprovalDecision::RequireApproval,
            approvers: Vec::new(),
            enabled: true,
        },
        ApprovalRule {
            rule_id: "duration-over-120".to_string(),
            name: "Long actions require approval".to_string(),
            priority: 3,
            action_types: Vec::new(),
            min_risk_level: None,
            max_risk_level: None,
            min_duration_min: Some(121),
            max_duration_min: None,
            decision: ApprovalDecision::RequireApproval,
            approvers: Vec::new(),
            enabled: true,
        },
        ApprovalRule {
            rule_id: "analysis-reporting".to_string(),
            name: "Analysis and reporting require approval".to_string(),
            priority: 4,
            action_types: vec![ActionType::DataAnalysis, ActionType::ReportGeneration],
            min_risk_level: None,
            max_risk_level: None,
            min_duration_min: None,
            max_duration_min: None,
            decision: ApprovalDecision::RequireApproval,
            approvers: Vec::new(),
            enabled: true,
        },
        ApprovalRule {
            rule_id: "email-quick".to_string(),
            name: "Quick email responses auto-approve".to_string(),
            priority: 5,
            action_types: vec![ActionType::EmailResponse],
            min_risk_level: None,
            max_risk_level: None,
            min_duration_min: None,
            max_duration_min: Some(30),
            decision: ApprovalDecision::AutoApprove,
            approvers: Vec::new(),
            enabled: true,
        },
        ApprovalRule {
            rule_id: "follow-up-quick".to_string(),
            name: "Low-risk follow-ups auto-approve".to_string(),
            priority: 6,
            action_types: vec![ActionType::FollowUp],
            min_risk_level: None,
            max_risk_level: Some(RiskLevel::Low),
            min_duration_min: None,
            max_duration_min: Some(30),
            decision: ApprovalDecision::AutoApprove,
            approvers: Vec::new(),
            enabled: true,
        },
    ]
}

/// Serde shape for user-supplied rules under `approval.rules`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApprovalRuleConfig {
    pub rule_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_rule_priority")]
    pub priority: i32,
    #[serde(default)]
    pub action_types: Vec<String>,
    #[serde(default)]
    pub min_risk_level: Option<String>,
    #[serde(default)]
    pub max_risk_level: Option<String>,
    #[serde(default)]
    pub min_duration_min: Option<u32>,
    #[serde(default)]
    pub max_duration_min: Option<u32>,
    pub decision: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,
}

fn default_rule_priority() -> i32 {
    100
}

fn default_rule_enabled() -> bool {
    true
}

impl ApprovalRuleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rule_id.trim().is_empty() {
            return Err("rule_id must be non-empty".to_string());
        }
        if ApprovalDecision::parse(&self.decision).is_none() {
            return Err(format!("unknown decision `{}`", self.decision));
        }
        for raw in &self.action_types {
            if ActionType::parse(raw).is_none() {
                return Err(format!("unknown action type `{raw}`"));
            }
        }
        for raw in self.min_risk_level.iter().chain(self.max_risk_level.iter()) {
            if RiskLevel::parse(raw).is_none() {
                return Err(format!("unknown risk level `{raw}`"));
            }
        }
        Ok(())
    }

    pub fn into_rule(self) -> Result<ApprovalRule, String> {
        self.validate()?;
        Ok(ApprovalRule {
            name: if self.name.trim().is_empty() {
                self.rule_id.clone()
            } else {
                self.name
            },
            rule_id: self.rule_id,
            priority: self.priority,
            action_types: self
                .action_types
                .iter()
                .filter_map(|raw| ActionType::parse(raw))
                .collect(),
            min_risk_level: self.min_risk_level.as_deref().and_then(RiskLevel::parse),
            max_risk_level: self.max_risk_level.as_deref().and_then(RiskLevel::parse),
            min_duration_min: self.min_duration_min,
            max_duration_min: self.max_duration_min,
            decision: ApprovalDecision::parse(&self.decision)
                .ok_or_else(|| format!("unknown decision `{}`", self.decision))?,
            approvers: self.approvers,
            enabled: self.enabled,
        })
    }
}
