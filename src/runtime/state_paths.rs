use crate::vault::VaultPaths;
use std::path::PathBuf;

/// Supervisor bookkeeping files, all under the vault's System_Log so the
/// whole deployment stays one directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub vault: VaultPaths,
}

impl StatePaths {
    pub fn new(vault: VaultPaths) -> Self {
        Self { vault }
    }

    pub fn supervisor_state_path(&self) -> PathBuf {
        self.vault.system_log_dir().join("supervisor_state.json")
    }

    pub fn supervisor_lock_path(&self) -> PathBuf {
        self.vault.system_log_dir().join("supervisor.lock")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.vault.system_log_dir().join("supervisor.stop")
    }

    pub fn rules_reload_path(&self) -> PathBuf {
        self.vault.system_log_dir().join("rules.reload")
    }
}
