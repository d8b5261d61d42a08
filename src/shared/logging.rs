use super::time::now_rfc3339;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn runtime_log_path(vault_root: &Path) -> PathBuf {
    vault_root.join("System_Log/runtime.log")
}

/// Minimum level for runtime log lines, set once at startup from
/// `--log-level` (via VAULTFLOW_LOG_LEVEL). Unknown levels log everything.
fn level_rank(level: &str) -> u8 {
    match level {
        "debug" => 0,
        "info" => 1,
        "warn" => 2,
        "error" => 3,
        _ => 0,
    }
}

fn minimum_level() -> u8 {
    static MINIMUM: std::sync::OnceLock<u8> = std::sync::OnceLock::new();
    *MINIMUM.get_or_init(|| {
        std::env::var("VAULTFLOW_LOG_LEVEL")
            .map(|raw| level_rank(raw.trim()))
            .unwrap_or(0)
    })
}

/// Appends one structured line to the runtime log. Logging must never take
/// the system down, so callers treat failures as advisory.
pub fn append_runtime_log(vault_root: &Path, level: &str, event: &str, message: &str) {
    if level_rank(level) < minimum_level() {
        return;
    }
    let line = format!("{} {level} {event} {message}", now_rfc3339());
    let _ = append_log_line(&runtime_log_path(vault_root), &line);
}

fn append_log_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
