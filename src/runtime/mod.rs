pub mod dashboard;
pub mod health;
pub mod ownership_lock;
pub mod pipeline;
pub mod planner;
pub mod service;
pub mod state_paths;
pub mod supervisor;
pub mod watcher;
pub(crate) mod worker_primitives;

pub use crate::shared::errors::RuntimeError;
pub use dashboard::DashboardWriter;
pub use health::{probe_with_timeout, run_health_sweep, ServiceBoard, ServiceHealthRecord};
pub use ownership_lock::{
    cleanup_stale_supervisor, clear_start_lock, is_process_alive, reserve_start_lock, signal_stop,
    stop_active_supervisor, supervisor_ownership_state, OwnershipState, StopResult,
};
pub use pipeline::PipelineWorker;
pub use planner::{Planner, TemplatePlanner};
pub use service::{HealthReport, Service, ServiceState, WorkerContext, WorkerService};
pub use state_paths::StatePaths;
pub use supervisor::{
    build_runtime, load_supervisor_state, run_supervisor, save_supervisor_state, Runtime,
    SupervisorState,
};
pub use watcher::InboxWatcher;
