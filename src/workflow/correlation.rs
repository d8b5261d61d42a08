use super::state::WorkflowState;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{new_uuid, split_stem_suffix};
use crate::shared::time::now_rfc3339;
use crate::vault::VaultPaths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StateTransitionRecord {
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    pub timestamp: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

/// Everything known about one action's journey through the pipeline,
/// keyed by correlation id.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkflowContext {
    pub correlation_id: String,
    pub action_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub approval_id: String,
    pub current_state: WorkflowState,
    #[serde(default)]
    pub state_history: Vec<StateTransitionRecord>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: String,
}

#[derive(Default)]
struct TrackerInner {
    contexts: BTreeMap<String, WorkflowContext>,
    by_action: BTreeMap<String, String>,
    by_plan: BTreeMap<String, String>,
}

/// In-memory index of open workflow instances. Rebuilt from the vault on
/// startup and snapshotted on shutdown; the single lock keeps updates
/// from concurrent transitions coherent.
#[derive(Default)]
pub struct CorrelationTracker {
    inner: Mutex<TrackerInner>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context(&self, action_id: &str, state: WorkflowState) -> String {
        let correlation_id = new_uuid();
        let now = now_rfc3339();
        let context = WorkflowContext {
            correlation_id: correlation_id.clone(),
            action_id: action_id.to_string(),
            plan_id: String::new(),
            approval_id: String::new(),
            current_state: state,
            state_history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            retry_count: 0,
            last_error: String::new(),
        };
        let mut inner = self.inner.lock().expect("tracker lock");
        inner
            .by_action
            .insert(action_id.to_string(), correlation_id.clone());
        inner.contexts.insert(correlation_id.clone(), context);
        correlation_id
    }

    pub fn attach_plan(&self, correlation_id: &str, plan_id: &str) {
        let mut inner = self.inner.lock().expect("tracker lock");
        if let Some(context) = inner.contexts.get_mut(correlation_id) {
            if context.plan_id.is_empty() {
                context.plan_id = plan_id.to_string();
                context.updated_at = now_rfc3339();
            }
        }
        inner
            .by_plan
            .insert(plan_id.to_string(), correlation_id.to_string());
    }

    pub fn attach_approval(&self, correlation_id: &str, approval_id: &str) {
        let mut inner = self.inner.lock().expect("tracker lock");
        if let Some(context) = inner.contexts.get_mut(correlation_id) {
            if context.approval_id.is_empty() {
                context.approval_id = approval_id.to_string();
                context.updated_at = now_rfc3339();
            }
        }
    }

    pub fn record_transition(
        &self,
        correlation_id: &str,
        from_state: WorkflowState,
        to_state: WorkflowState,
        success: bool,
        error: &str,
    ) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let Some(context) = inner.contexts.get_mut(correlation_id) else {
            return;
        };
        context.state_history.push(StateTransitionRecord {
            from_state,
            to_state,
            timestamp: now_rfc3339(),
            success,
            error: error.to_string(),
        });
        if success {
            context.current_state = to_state;
        } else {
            context.last_error = error.to_string();
        }
        context.updated_at = now_rfc3339();
    }

    pub fn record_retry(&self, correlation_id: &str) {
        let mut inner = self.inner.lock().expect("tracker lock");
        if let Some(context) = inner.contexts.get_mut(correlation_id) {
            context.retry_count += 1;
            context.updated_at = now_rfc3339();
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<WorkflowContext> {
        self.inner
            .lock()
            .expect("tracker lock")
            .contexts
            .get(correlation_id)
            .cloned()
    }

    pub fn by_action_id(&self, action_id: &str) -> Option<WorkflowContext> {
        let inner = self.inner.lock().expect("tracker lock");
        inner
            .by_action
            .get(action_id)
            .and_then(|corr| inner.contexts.get(corr))
            .cloned()
    }

    pub fn by_plan_id(&self, plan_id: &str) -> Option<WorkflowContext> {
        let inner = self.inner.lock().expect("tracker lock");
        inner
            .by_plan
            .get(plan_id)
            .and_then(|corr| inner.contexts.get(corr))
            .cloned()
    }

    /// Contexts whose current state is non-terminal.
    pub fn open_contexts(&self) -> Vec<WorkflowContext> {
        self.inner
            .lock()
            .expect("tracker lock")
            .contexts
            .values()
            .filter(|c| !c.current_state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn open_len(&self) -> usize {
        self.inner
            .lock()
            .expect("tracker lock")
            .contexts
            .values()
            .filter(|c| !c.current_state.is_terminal())
            .count()
    }

    /// Closes out a terminal context, dropping its index entries.
    pub fn remove(&self, correlation_id: &str) {
        let mut inner = self.inner.lock().expect("tracker lock");
        if let Some(context) = inner.contexts.remove(correlation_id) {
            inner.by_action.remove(&context.action_id);
            if !context.plan_id.is_empty() {
                inner.by_plan.remove(&context.plan_id);
            }
        }
    }

    /// Writes open contexts to `System_Log/open_contexts.json`.
    pub fn snapshot(&self, path: &Path) -> std::io::Result<()> {
        let open = self.open_contexts();
        let body = serde_json::to_vec_pretty(&open)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write_file(path, &body)
    }

    /// Loads a shutdown snapshot, then reconciles against the vault: a
    /// folder scan wins over the snapshot, and stems on disk without a
    /// snapshot entry get fresh contexts.
    pub fn restore(&self, snapshot_path: &Path, vault: &VaultPaths) -> usize {
        let mut restored = 0usize;
        if let Ok(raw) = fs::read_to_string(snapshot_path) {
            if let Ok(contexts) = serde_json::from_str::<Vec<WorkflowContext>>(&raw) {
                let mut inner = self.inner.lock().expect("tracker lock");
                for context in contexts {
                    inner
                        .by_action
                        .insert(context.action_id.clone(), context.correlation_id.clone());
                    if !context.plan_id.is_empty() {
                        inner
                            .by_plan
                            .insert(context.plan_id.clone(), context.correlation_id.clone());
                    }
                    inner
                        .contexts
                        .insert(context.correlation_id.clone(), context);
                    restored += 1;
                }
            }
        }
        restored + self.rebuild_from_vault(vault)
    }

    /// Scans non-terminal folders and creates contexts for stems the
    /// tracker does not know yet.
    pub fn rebuild_from_vault(&self, vault: &VaultPaths) -> usize {
        let mut created = 0usize;
        for folder in crate::vault::PIPELINE_FOLDERS {
            let Some(state) = WorkflowState::from_folder(folder) else {
                continue;
            };
            if state.is_terminal() || state == WorkflowState::Inbox {
                continue;
            }
            let Ok(paths) = vault.sorted_entries(folder) else {
                continue;
            };
            for path in paths {
                let Some(filename) = path.file_name().and_then(|v| v.to_str()) else {
                    continue;
                };
                let Some((stem, _suffix)) = split_stem_suffix(filename) else {
                    continue;
                };
                if self.by_action_id(stem).is_some() {
                    continue;
                }
                self.create_context(stem, state);
                created += 1;
            }
        }
        created
    }
}
