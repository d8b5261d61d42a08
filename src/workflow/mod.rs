pub mod action;
pub mod correlation;
pub mod dead_letter;
pub mod engine;
pub mod ingest;
pub mod locking;
pub mod retry;
pub mod state;

pub use action::{Action, ActionType, Priority};
pub use correlation::{CorrelationTracker, StateTransitionRecord, WorkflowContext};
pub use dead_letter::{DeadLetterError, DeadLetterMeta, DeadLetterQueue};
pub use engine::{
    map_transition_event, EngineMetrics, TransitionOutcome, TransitionRequest, WorkflowEngine,
};
pub use ingest::IngestOutcome;
pub use locking::{StemLockGuard, StemLocks};
pub use retry::RetryPolicy;
pub use state::{is_valid_transition, WorkflowState};
