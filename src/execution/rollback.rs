use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    /// On any step failure, pop and invoke compensations in reverse.
    #[default]
    Automatic,
    /// Pause the run and preserve the stack for an operator.
    Manual,
    /// Fire and forget.
    None,
}

impl RollbackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "AUTOMATIC",
            Self::Manual => "MANUAL",
            Self::None => "NONE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AUTOMATIC" => Some(Self::Automatic),
            "MANUAL" => Some(Self::Manual),
            "NONE" => Some(Self::None),
            _ => None,
        }
    }
}

/// One compensation owed for a completed step, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackEntry {
    pub step_index: usize,
    pub reversible: bool,
    pub token: Option<serde_json::Value>,
}

/// LIFO stack of compensations scoped to one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RollbackStack {
    entries: Vec<RollbackEntry>,
}

impl RollbackStack {
    pub fn push(&mut self, entry: RollbackEntry) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<RollbackEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
