use crate::shared::ids::new_uuid;
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    EmailResponse,
    MeetingRequest,
    DocumentCreation,
    DataAnalysis,
    ReportGeneration,
    FollowUp,
    #[default]
    Other,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailResponse => "email_response",
            Self::MeetingRequest => "meeting_request",
            Self::DocumentCreation => "document_creation",
            Self::DataAnalysis => "data_analysis",
            Self::ReportGeneration => "report_generation",
            Self::FollowUp => "follow_up",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email_response" => Some(Self::EmailResponse),
            "meeting_request" => Some(Self::MeetingRequest),
            "document_creation" => Some(Self::DocumentCreation),
            "data_analysis" => Some(Self::DataAnalysis),
            "report_generation" => Some(Self::ReportGeneration),
            "follow_up" => Some(Self::FollowUp),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Default, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
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

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of externally-originated work, persisted as
/// `<id>.action.yaml` in the pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub priority: Priority,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub created_at: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_min: Option<u32>,
}

impl Action {
    pub fn new(source: &str) -> Self {
        Self {
            id: new_uuid(),
            action_type: ActionType::Other,
            priority: Priority::Medium,
            context: BTreeMap::new(),
            created_at: now_rfc3339(),
            source: source.to_string(),
            estimated_duration_min: None,
        }
    }

    /// Builds an action from arbitrary ingress text. Lines of the form
    /// `key: value` populate the typed fields where they match; everything
    /// else is preserved in `context`.
    pub fn infer_from_text(raw: &str, source: &str) -> Self {
        let mut action = Action::new(source);
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "type" => {
                    if let Some(kind) = ActionType::parse(value) {
                        action.action_type = kind;
                    }
                }
                "priority" => {
                    if let Some(priority) = Priority::parse(value) {
                        action.priority = priority;
                    }
                }
                "estimated_duration_min" => {
                    if let Ok(minutes) = value.parse::<u32>() {
                        action.estimated_duration_min = Some(minutes);
                    }
                }
                "source" => {
                    action.source = value.to_string();
                }
                _ => {
                    action.context.insert(key, value.to_string());
                }
            }
        }
        action
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}
