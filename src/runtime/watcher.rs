use super::service::WorkerContext;
use super::worker_primitives::{sleep_with_stop, WORKER_POLL_MS};
use crate::bus::{Event, EventBus, EventType};
use crate::shared::ids::split_stem_suffix;
use crate::vault::{VaultPaths, PLAN_SUFFIX};
use crate::workflow::{CorrelationTracker, WorkflowState};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Polls the externally-writable folders. New Inbox files become
/// `file.created` events for ingestion; a plan that shows up in Approved
/// while its context still waits in Pending_Approval is a human approval
/// and is announced the same way.
pub struct InboxWatcher {
    vault: VaultPaths,
    bus: Arc<EventBus>,
    tracker: Arc<CorrelationTracker>,
}

impl InboxWatcher {
    pub fn new(vault: VaultPaths, bus: Arc<EventBus>, tracker: Arc<CorrelationTracker>) -> Self {
        Self {
            vault,
            bus,
            tracker,
        }
    }

    pub fn run(self, ctx: WorkerContext) {
        let mut announced: BTreeSet<PathBuf> = BTreeSet::new();
        while !ctx.stopped() {
            ctx.beat_now();
            self.scan_inbox(&mut announced);
            self.scan_approved(&mut announced);
            announced.retain(|path| path.exists());
            if !sleep_with_stop(&ctx.stop, Duration::from_millis(WORKER_POLL_MS)) {
                break;
            }
        }
    }

    fn scan_inbox(&self, announced: &mut BTreeSet<PathBuf>) {
        let Ok(entries) = self.vault.sorted_entries("Inbox") else {
            return;
        };
        for path in entries {
            if announced.contains(&path) {
                continue;
            }
            announced.insert(path.clone());
            self.bus.publish(
                Event::new(EventType::FileCreated, "inbox_watcher")
                    .with_payload("folder", json!("Inbox"))
                    .with_payload("path", json!(path.display().to_string())),
            );
        }
    }

    fn scan_approved(&self, announced: &mut BTreeSet<PathBuf>) {
        let Ok(entries) = self.vault.sorted_entries("Approved") else {
            return;
        };
        for path in entries {
            if announced.contains(&path) {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            let Some((stem, suffix)) = split_stem_suffix(filename) else {
                continue;
            };
            if suffix != PLAN_SUFFIX {
                continue;
            }
            // Only announce plans a human moved here; the pipeline's own
            // transitions already publish their events.
            let waiting = self
                .tracker
                .by_action_id(stem)
                .map(|c| {
                    matches!(
                        c.current_state,
                        WorkflowState::PendingApproval | WorkflowState::ApprovalReview
                    )
                })
                .unwrap_or(false);
            if !waiting {
                continue;
            }
            announced.insert(path.clone());
            self.bus.publish(
                Event::new(EventType::FileCreated, "inbox_watcher")
                    .with_payload("folder", json!("Approved"))
                    .with_payload("stem", json!(stem))
                    .with_payload("path", json!(path.display().to_string())),
            );
        }
    }
}
