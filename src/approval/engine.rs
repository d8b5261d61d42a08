use super::risk::{bucket, risk_score, RiskLevel};
use super::rules::{default_rules, ApprovalDecision, ApprovalRule, ApprovalRuleConfig};
use crate::workflow::{Action, ActionType, Priority};
use std::sync::RwLock;

/// Inputs to one approval evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalContext {
    pub action_id: String,
    pub plan_id: String,
    pub action_type: ActionType,
    pub priority: Priority,
    pub estimated_duration_min: u32,
    pub source: String,
}

impl ApprovalContext {
    pub fn for_action(action: &Action, plan_id: &str) -> Self {
        Self {
            action_id: action.id.clone(),
            plan_id: plan_id.to_string(),
            action_type: action.action_type,
            priority: action.priority,
            estimated_duration_min: action.estimated_duration_min.unwrap_or(0),
            source: action.source.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationResult {
    pub decision: ApprovalDecision,
    pub matched_rule_id: Option<String>,
    pub reason: String,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub approvers: Vec<String>,
}

/// Ordered first-match rule evaluation with an atomically swappable rule
/// set (reloads replace the whole list).
pub struct ApprovalRuleEngine {
    rules: RwLock<Vec<ApprovalRule>>,
}

impl Default for ApprovalRuleEngine {
    fn default() -> Self {
        Self::with_rules(Vec::new())
    }
}

impl ApprovalRuleEngine {
    /// Default rules plus user-configured ones, sorted by priority.
    pub fn with_rules(extra: Vec<ApprovalRule>) -> Self {
        let mut rules = default_rules();
        rules.extend(extra);
        rules.sort_by_key(|r| r.priority);
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn from_configs(configs: &[ApprovalRuleConfig]) -> Result<Self, String> {
        let extra = configs
            .iter()
            .cloned()
            .map(|c| c.into_rule())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_rules(extra))
    }

    pub fn evaluate(&self, context: &ApprovalContext) -> EvaluationResult {
        let score = risk_score(
            context.action_type,
            context.estimated_duration_min,
            context.priority,
            &context.source,
        );
        let risk_level = bucket(score);

        let rules = self.rules.read().expect("rule set lock");
        for rule in rules.iter() {
            if rule.matches(context.action_type, risk_level, context.estimated_duration_min) {
                return EvaluationResult {
                    decision: rule.decision,
                    matched_rule_id: Some(rule.rule_id.clone()),
                    reason: format!("matched rule: {}", rule.name),
                    risk_score: score,
                    risk_level,
                    approvers: rule.approvers.clone(),
                };
            }
        }

        EvaluationResult {
            decision: ApprovalDecision::RequireApproval,
            matched_rule_id: None,
            reason: "no matching rules; approval required by default".to_string(),
            risk_score: score,
            risk_level,
            approvers: Vec::new(),
        }
    }

    /// Swaps the full rule set in one write. Used by the reload sentinel.
    pub fn replace_rules(&self, configs: &[ApprovalRuleConfig]) -> Result<usize, String> {
        let extra = configs
            .iter()
            .cloned()
            .map(|c| c.into_rule())
            .collect::<Result<Vec<_>, _>>()?;
        let mut rules = default_rules();
        rules.extend(extra);
        rules.sort_by_key(|r| r.priority);
        let count = rules.len();
        *self.rules.write().expect("rule set lock") = rules;
        Ok(count)
    }

    pub fn rules(&self) -> Vec<ApprovalRule> {
        self.rules.read().expect("rule set lock").clone()
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().expect("rule set lock");
        for rule in rules.iter_mut() {
            if rule.rule_id == rule_id {
                rule.enabled = enabled;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(
        action_type: ActionType,
        duration: u32,
        priority: Priority,
        source: &str,
    ) -> ApprovalContext {
        ApprovalContext {
            action_id: "action-1".to_string(),
            plan_id: "plan-1".to_string(),
            action_type,
            priority,
            estimated_duration_min: duration,
            source: source.to_string(),
        }
    }

    #[test]
    fn quick_email_auto_approves() {
        let engine = ApprovalRuleEngine::default();
        let result = engine.evaluate(&context(
            ActionType::EmailResponse,
            15,
            Priority::Medium,
            "gmail",
        ));
        assert_eq!(result.decision, ApprovalDecision::AutoApprove);
        assert_eq!(result.matched_rule_id.as_deref(), Some("email-quick"));
        assert_eq!(result.risk_level, RiskLevel::Low);
    }

    #[test]
    fn long_data_analysis_requires_approval() {
        let engine = ApprovalRuleEngine::default();
        let result = engine.evaluate(&context(
            ActionType::DataAnalysis,
            180,
            Priority::Medium,
            "file_watcher",
        ));
        assert_eq!(result.decision, ApprovalDecision::RequireApproval);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert_eq!(result.matched_rule_id.as_deref(), Some("high-risk"));
    }

    #[test]
    fn medium_risk_long_duration_matches_duration_rule() {
        let engine = ApprovalRuleEngine::default();
        // Document creation at 150 minutes: score 3 + 2 = 5 (medium), so
        // the duration rule is the first to match.
        let result = engine.evaluate(&context(
            ActionType::DocumentCreation,
            150,
            Priority::Medium,
            "file_watcher",
        ));
        assert_eq!(result.decision, ApprovalDecision::RequireApproval);
        assert_eq!(result.matched_rule_id.as_deref(), Some("duration-over-120"));
    }

    #[test]
    fn critical_risk_escalates_with_advisory_approvers() {
        let engine = ApprovalRuleEngine::default();
        let result = engine.evaluate(&context(
            ActionType::ReportGeneration,
            200,
            Priority::Critical,
            "external",
        ));
        assert_eq!(result.decision, ApprovalDecision::Escalate);
        assert_eq!(result.matched_rule_id.as_deref(), Some("critical-escalate"));
        assert_eq!(result.approvers, vec!["admin".to_string()]);
    }

    #[test]
    fn unmatched_context_defaults_to_require_approval() {
        let engine = ApprovalRuleEngine::default();
        let result = engine.evaluate(&context(
            ActionType::MeetingRequest,
            40,
            Priority::Medium,
            "calendar",
        ));
        assert_eq!(result.decision, ApprovalDecision::RequireApproval);
        assert!(result.matched_rule_id.is_none());
    }

    #[test]
    fn user_rules_can_outrank_defaults() {
        let config = ApprovalRuleConfig {
            rule_id: "meetings-auto".to_string(),
            name: "Auto-approve meetings".to_string(),
            priority: 0,
            action_types: vec!["meeting_request".to_string()],
            min_risk_level: None,
            max_risk_level: Some("medium".to_string()),
            min_duration_min: None,
            max_duration_min: None,
            decision: "auto_approve".to_string(),
            approvers: Vec::new(),
            enabled: true,
        };
        let engine = ApprovalRuleEngine::from_configs(&[config]).expect("engine");
        let result = engine.evaluate(&context(
            ActionType::MeetingRequest,
            40,
            Priority::Medium,
            "calendar",
        ));
        assert_eq!(result.decision, ApprovalDecision::AutoApprove);
        assert_eq!(result.matched_rule_id.as_deref(), Some("meetings-auto"));
    }

    #[test]
    fn replace_rules_swaps_atomically() {
        let engine = ApprovalRuleEngine::default();
        let before = engine.rules().len();
        engine.replace_rules(&[]).expect("reload");
        assert_eq!(engine.rules().len(), before);
        assert!(engine.set_rule_enabled("email-quick", false));
        assert!(!engine.set_rule_enabled("nonexistent", false));
    }
}
