use super::ConfigError;
use crate::approval::rules::ApprovalRuleConfig;
use crate::execution::{ExecutionMode, RollbackStrategy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub vault_path: PathBuf,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub approval: ApprovalSettings,
    #[serde(default)]
    pub dashboard: DashboardSettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub rollback_strategy: RollbackStrategy,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            rollback_strategy: RollbackStrategy::default(),
            step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_lock_stale_ms")]
    pub stale_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusSettings {
    #[serde(default = "default_bus_history_size")]
    pub history_size: usize,
    #[serde(default = "default_bus_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_bus_drain_ms")]
    pub drain_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApprovalSettings {
    #[serde(default)]
    pub rules: Vec<ApprovalRuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardSettings {
    #[serde(default = "default_dashboard_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditSettings {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

fn default_step_timeout_ms() -> u64 {
    120_000
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_cap_ms() -> u64 {
    60_000
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_lock_timeout_ms() -> u64 {
    10_000
}
fn default_lock_stale_ms() -> u64 {
    300_000
}
fn default_bus_history_size() -> usize {
    1_000
}
fn default_bus_subscriber_queue() -> usize {
    4_096
}
fn default_bus_drain_ms() -> u64 {
    10_000
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}
fn default_dashboard_interval_ms() -> u64 {
    30_000
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("System_Log/Audit/immutable_audit.jsonl")
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            cap_ms: default_retry_cap_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            stale_ms: default_lock_stale_ms(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            history_size: default_bus_history_size(),
            subscriber_queue: default_bus_subscriber_queue(),
            drain_ms: default_bus_drain_ms(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_dashboard_interval_ms(),
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

impl Settings {
    pub fn with_vault_path(vault_path: impl Into<PathBuf>) -> Self {
        Self {
            vault_path: vault_path.into(),
            execution: ExecutionSettings::default(),
            retry: RetrySettings::default(),
            lock: LockSettings::default(),
            bus: BusSettings::default(),
            health: HealthSettings::default(),
            approval: ApprovalSettings::default(),
            dashboard: DashboardSettings::default(),
            audit: AuditSettings::default(),
        }
    }

    /// Resolves `audit.path` relative to the vault root unless absolute.
    pub fn audit_log_path(&self) -> PathBuf {
        if self.audit.path.is_absolute() {
            self.audit.path.clone()
        } else {
            self.vault_path.join(&self.audit.path)
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads `<vault>/config.yaml` when present, otherwise defaults.
    pub fn load_or_default(vault_path: &Path) -> Result<Self, ConfigError> {
        let candidate = vault_path.join("config.yaml");
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::with_vault_path(vault_path))
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        crate::shared::fs_atomic::atomic_write_file(path, body.as_bytes()).map_err(|source| {
            ConfigError::Write {
                path: path.display().to_string(),
                source,
            }
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&str, u64); 7] = [
            ("retry.base_ms", self.retry.base_ms),
            ("retry.cap_ms", self.retry.cap_ms),
            ("lock.timeout_ms", self.lock.timeout_ms),
            ("lock.stale_ms", self.lock.stale_ms),
            ("health.interval_ms", self.health.interval_ms),
            ("health.timeout_ms", self.health.timeout_ms),
            ("dashboard.interval_ms", self.dashboard.interval_ms),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                reason: "must allow at least one attempt".to_string(),
            });
        }
        if self.retry.cap_ms < self.retry.base_ms {
            return Err(ConfigError::InvalidValue {
                key: "retry.cap_ms".to_string(),
                reason: "cap must be at least the base delay".to_string(),
            });
        }
        if self.bus.subscriber_queue == 0 || self.bus.history_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "bus".to_string(),
                reason: "queue and history sizes must be greater than zero".to_string(),
            });
        }
        for rule in &self.approval.rules {
            rule.validate().map_err(|reason| ConfigError::InvalidValue {
                key: format!("approval.rules.{}", rule.rule_id),
                reason,
            })?;
        }
        Ok(())
    }
}
