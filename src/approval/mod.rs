pub mod engine;
pub mod record;
pub mod risk;
pub mod rules;

pub use engine::{ApprovalContext, ApprovalRuleEngine, EvaluationResult};
pub use record::ApprovalRecord;
pub use risk::{bucket, risk_score, RiskLevel};
pub use rules::{default_rules, ApprovalDecision, ApprovalRule, ApprovalRuleConfig};
