use super::plan::{Step, StepKind};
use crate::shared::errors::PipelineError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of a successfully executed step. The rollback token is the
/// opaque handle an adapter returns for reversible work (a created-file
/// path, a calendar event id, an idempotency key for a compensating
/// call).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub detail: String,
    pub rollback_token: Option<serde_json::Value>,
}

/// Seam to the outside world. Real email/calendar/file/api/script
/// integrations implement this; the engine owns ordering, timeouts,
/// retry, and rollback.
pub trait StepAdapter: Send + Sync {
    fn kind(&self) -> StepKind;

    fn execute(&self, step: &Step) -> Result<StepOutcome, PipelineError>;

    fn rollback(&self, step: &Step, token: &serde_json::Value) -> Result<(), PipelineError>;
}

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<StepKind, Arc<dyn StepAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn StepAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
