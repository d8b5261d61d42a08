pub mod broker;

pub use broker::{BusStats, EventBus, SubscribeMode};

use crate::shared::ids::new_uuid;
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of event types carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum EventType {
    #[serde(rename = "file.created")]
    FileCreated,
    #[serde(rename = "file.modified")]
    FileModified,
    #[serde(rename = "file.moved")]
    FileMoved,
    #[serde(rename = "file.deleted")]
    FileDeleted,
    #[serde(rename = "action.generated")]
    ActionGenerated,
    #[serde(rename = "action.processed")]
    ActionProcessed,
    #[serde(rename = "action.approved")]
    ActionApproved,
    #[serde(rename = "action.executed")]
    ActionExecuted,
    #[serde(rename = "action.failed")]
    ActionFailed,
    #[serde(rename = "plan.created")]
    PlanCreated,
    #[serde(rename = "plan.approved")]
    PlanApproved,
    #[serde(rename = "plan.execution_completed")]
    PlanExecutionCompleted,
    #[serde(rename = "email.received")]
    EmailReceived,
    #[serde(rename = "approval.required")]
    ApprovalRequired,
    #[serde(rename = "approval.granted")]
    ApprovalGranted,
    #[serde(rename = "approval.denied")]
    ApprovalDenied,
    #[serde(rename = "service.started")]
    ServiceStarted,
    #[serde(rename = "service.stopped")]
    ServiceStopped,
    #[serde(rename = "service.error")]
    ServiceError,
    #[serde(rename = "health.check")]
    HealthCheck,
    #[serde(rename = "health.status")]
    HealthStatus,
    #[serde(rename = "system.shutdown")]
    SystemShutdown,
    #[serde(rename = "system.restart")]
    SystemRestart,
    #[serde(rename = "bus.overflow")]
    BusOverflow,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileCreated => "file.created",
            Self::FileModified => "file.modified",
            Self::FileMoved => "file.moved",
            Self::FileDeleted => "file.deleted",
            Self::ActionGenerated => "action.generated",
            Self::ActionProcessed => "action.processed",
            Self::ActionApproved => "action.approved",
            Self::ActionExecuted => "action.executed",
            Self::ActionFailed => "action.failed",
            Self::PlanCreated => "plan.created",
            Self::PlanApproved => "plan.approved",
            Self::PlanExecutionCompleted => "plan.execution_completed",
            Self::EmailReceived => "email.received",
            Self::ApprovalRequired => "approval.required",
            Self::ApprovalGranted => "approval.granted",
            Self::ApprovalDenied => "approval.denied",
            Self::ServiceStarted => "service.started",
            Self::ServiceStopped => "service.stopped",
            Self::ServiceError => "service.error",
            Self::HealthCheck => "health.check",
            Self::HealthStatus => "health.status",
            Self::SystemShutdown => "system.shutdown",
            Self::SystemRestart => "system.restart",
            Self::BusOverflow => "bus.overflow",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub event_id: String,
    pub timestamp: String,
    pub source: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, source: &str) -> Self {
        Self {
            event_type,
            event_id: new_uuid(),
            timestamp: now_rfc3339(),
            source: source.to_string(),
            correlation_id: None,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }
}
