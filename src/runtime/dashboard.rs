use super::health::ServiceBoard;
use super::service::WorkerContext;
use super::worker_primitives::sleep_with_stop;
use crate::audit::AuditLog;
use crate::execution::ExecutionEngine;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::append_runtime_log;
use crate::shared::time::now_rfc3339;
use crate::vault::VaultPaths;
use crate::workflow::WorkflowEngine;
use std::sync::Arc;
use std::time::Duration;

/// Periodically snapshots folder counts, service health, engine metrics,
/// and the audit tail into Dashboard.md with the same temp-and-rename
/// write every other vault mutation uses.
pub struct DashboardWriter {
    vault: VaultPaths,
    audit: Arc<AuditLog>,
    board: ServiceBoard,
    engine: Arc<WorkflowEngine>,
    execution: Arc<ExecutionEngine>,
    interval: Duration,
}

impl DashboardWriter {
    pub fn new(
        vault: VaultPaths,
        audit: Arc<AuditLog>,
        board: ServiceBoard,
        engine: Arc<WorkflowEngine>,
        execution: Arc<ExecutionEngine>,
        interval_ms: u64,
    ) -> Self {
        Self {
            vault,
            audit,
            board,
            engine,
            execution,
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub fn run(self, ctx: WorkerContext) {
        while !ctx.stopped() {
            ctx.beat_now();
            self.write_once();
            if !sleep_with_stop(&ctx.stop, self.interval) {
                break;
            }
        }
        // One final snapshot so the dashboard reflects the shutdown.
        self.write_once();
    }

    pub fn write_once(&self) {
        let body = self.render();
        if let Err(err) = atomic_write_file(&self.vault.dashboard_file(), body.as_bytes()) {
            append_runtime_log(
                &self.vault.root,
                "error",
                "dashboard.write_failed",
                &err.to_string(),
            );
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Vaultflow Dashboard\n\n");
        out.push_str(&format!(
            "## System Status\n- **Last Updated**: {}\n\n",
            now_rfc3339()
        ));

        out.push_str("## Pipeline\n");
        for (folder, count) in self.vault.folder_counts() {
            out.push_str(&format!("- **{folder}**: {count}\n"));
        }
        out.push('\n');

        out.push_str("## Services\n");
        let services = self.board.snapshot();
        if services.is_empty() {
            out.push_str("- none registered\n");
        }
        for (name, record) in services {
            out.push_str(&format!(
                "- **{name}**: {} (checked {}{})\n",
                record.state.as_str(),
                record.last_check,
                record
                    .last_error
                    .as_ref()
                    .map(|e| format!(", last error: {e}"))
                    .unwrap_or_default()
            ));
        }
        out.push('\n');

        let workflow = self.engine.metrics();
        let execution = self.execution.metrics();
        let audit_stats = self.audit.stats();
        out.push_str("## Metrics\n");
        out.push_str(&format!(
            "- **Transitions**: {} completed, {} failed, {} retries\n",
            workflow.transitions_completed, workflow.transitions_failed, workflow.retries
        ));
        out.push_str(&format!(
            "- **Dead Letter**: {} entries\n",
            workflow.dlq_size
        ));
        out.push_str(&format!(
            "- **Open Workflows**: {}\n",
            workflow.active_correlations
        ));
        out.push_str(&format!(
            "- **Plans**: {} executed, {} failed, {} rollbacks\n",
            execution.plans_executed, execution.plans_failed, execution.rollbacks_performed
        ));
        out.push_str(&format!(
            "- **Audit**: {} entries ({} approvals, {} executions)\n\n",
            audit_stats.total_entries, audit_stats.approval_events, audit_stats.execution_events
        ));

        out.push_str("## Recent Audit\n");
        match self.audit.tail(20) {
            Ok(entries) if !entries.is_empty() => {
                for entry in entries {
                    out.push_str(&format!(
                        "- {} `{}` {} {}\n",
                        entry.timestamp, entry.event_type, entry.actor, entry.resource_id
                    ));
                }
            }
            _ => out.push_str("- no entries yet\n"),
        }
        out
    }
}
