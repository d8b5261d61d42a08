pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use settings::{
    AuditSettings, BusSettings, DashboardSettings, ExecutionSettings, HealthSettings,
    LockSettings, RetrySettings, Settings,
};
