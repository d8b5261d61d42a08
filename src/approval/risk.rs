use crate::workflow::{ActionType, Priority};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Additive risk score: action type, duration, priority, and source each
/// contribute, then the total is bucketed.
pub fn risk_score(
    action_type: ActionType,
    estimated_duration_min: u32,
    priority: Priority,
    source: &str,
) -> u32 {
    let mut score = match action_type {
        ActionType::EmailResponse | ActionType::FollowUp => 1,
        ActionType::MeetingRequest => 2,
        ActionType::DocumentCreation => 3,
        ActionType::DataAnalysis | ActionType::ReportGeneration => 4,
        ActionType::Other => 2,
    };
    if estimated_duration_min > 180 {
        score += 3;
    } else if estimated_duration_min > 120 {
        score += 2;
    } else if estimated_duration_min > 60 {
        score += 1;
    }
    match priority {
        Priority::High => score += 2,
        Priority::Critical => score += 3,
        Priority::Low | Priority::Medium => {}
    }
    if source == "external" {
        score += 1;
    }
    score
}

pub fn bucket(score: u32) -> RiskLevel {
    match score {
        0..=3 => RiskLevel::Low,
        4..=5 => RiskLevel::Medium,
        6..=7 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}
