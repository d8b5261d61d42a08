use super::state::WorkflowState;
use crate::shared::fs_atomic::{atomic_move_file, atomic_write_file};
use crate::shared::ids::new_uuid;
use crate::shared::time::{now_compact, now_rfc3339};
use crate::vault::VaultPaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid dead letter metadata {path}: {source}")]
    Meta {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("dead letter entry {id} not found")]
    NotFound { id: String },
}

/// Sidecar metadata written next to every quarantined file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DeadLetterMeta {
    pub dlq_id: String,
    pub original_filename: String,
    pub original_path: String,
    pub source_state: WorkflowState,
    pub error: String,
    pub attempts: u32,
    pub correlation_id: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub quarantined_at: String,
    #[serde(skip, default)]
    pub meta_path: PathBuf,
}

pub struct DeadLetterQueue {
    vault: VaultPaths,
}

impl DeadLetterQueue {
    pub fn new(vault: VaultPaths) -> Self {
        Self { vault }
    }

    fn dlq_dir(&self) -> PathBuf {
        self.vault.folder("Dead_Letter")
    }

    /// Moves the offending file into quarantine and records enough
    /// metadata to replay it later.
    pub fn admit(
        &self,
        filename: &str,
        source_state: WorkflowState,
        error: &str,
        attempts: u32,
        correlation_id: &str,
        context: serde_json::Value,
    ) -> Result<DeadLetterMeta, DeadLetterError> {
        let source_path = self.vault.folder(source_state.folder()).join(filename);
        let dlq_filename = format!("{}_{filename}", now_compact());
        let dlq_path = self.dlq_dir().join(&dlq_filename);

        if source_path.exists() {
            atomic_move_file(&source_path, &dlq_path).map_err(|source| DeadLetterError::Io {
                path: dlq_path.display().to_string(),
                source,
            })?;
        }

        let meta_path = dlq_path.with_file_name(format!("{dlq_filename}.meta.yaml"));
        let meta = DeadLetterMeta {
            dlq_id: new_uuid(),
            original_filename: filename.to_string(),
            original_path: source_path.display().to_string(),
            source_state,
            error: error.to_string(),
            attempts,
            correlation_id: correlation_id.to_string(),
            context,
            quarantined_at: now_rfc3339(),
            meta_path: meta_path.clone(),
        };
        let body = serde_yaml::to_string(&meta).map_err(|source| DeadLetterError::Meta {
            path: meta_path.display().to_string(),
            source,
        })?;
        atomic_write_file(&meta_path, body.as_bytes()).map_err(|source| DeadLetterError::Io {
            path: meta_path.display().to_string(),
            source,
        })?;
        Ok(meta)
    }

    /// Entries newest first, at most `limit`.
    pub fn entries(&self, limit: usize) -> Result<Vec<DeadLetterMeta>, DeadLetterError> {
        let dir = self.dlq_dir();
        let mut metas = Vec::new();
        let reader = fs::read_dir(&dir).map_err(|source| DeadLetterError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in reader.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            if !name.ends_with(".meta.yaml") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| DeadLetterError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let mut meta: DeadLetterMeta =
                serde_yaml::from_str(&raw).map_err(|source| DeadLetterError::Meta {
                    path: path.display().to_string(),
                    source,
                })?;
            meta.meta_path = path;
            metas.push(meta);
        }
        metas.sort_by(|a, b| b.quarantined_at.cmp(&a.quarantined_at));
        metas.truncate(limit);
        Ok(metas)
    }

    fn find(&self, dlq_id: &str) -> Result<DeadLetterMeta, DeadLetterError> {
        self.entries(usize::MAX)?
            .into_iter()
            .find(|meta| meta.dlq_id == dlq_id)
            .ok_or_else(|| DeadLetterError::NotFound {
                id: dlq_id.to_string(),
            })
    }

    /// Restores the quarantined file to its recorded source folder and
    /// removes the pair. Returns the restored path.
    pub fn retry(&self, dlq_id: &str) -> Result<PathBuf, DeadLetterError> {
        let meta = self.find(dlq_id)?;
        let data_path = data_path_for(&meta.meta_path);
        if !data_path.exists() {
            return Err(DeadLetterError::NotFound {
                id: dlq_id.to_string(),
            });
        }

        let target = self
            .vault
            .folder(meta.source_state.folder())
            .join(&meta.original_filename);
        atomic_move_file(&data_path, &target).map_err(|source| DeadLetterError::Io {
            path: target.display().to_string(),
            source,
        })?;
        fs::remove_file(&meta.meta_path).map_err(|source| DeadLetterError::Io {
            path: meta.meta_path.display().to_string(),
            source,
        })?;
        Ok(target)
    }

    /// Removes pairs quarantined more than `older_than_days` ago. Returns
    /// the number of entries removed.
    pub fn purge(&self, older_than_days: u64) -> Result<usize, DeadLetterError> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(older_than_days * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut purged = 0usize;
        for meta in self.entries(usize::MAX)? {
            let Ok(modified) = fs::metadata(&meta.meta_path).and_then(|m| m.modified()) else {
                continue;
            };
            if modified > cutoff {
                continue;
            }
            let data_path = data_path_for(&meta.meta_path);
            if data_path.exists() {
                let _ = fs::remove_file(&data_path);
            }
            fs::remove_file(&meta.meta_path).map_err(|source| DeadLetterError::Io {
                path: meta.meta_path.display().to_string(),
                source,
            })?;
            purged += 1;
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.entries(usize::MAX).map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn data_path_for(meta_path: &std::path::Path) -> PathBuf {
    let name = meta_path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or_default()
        .trim_end_matches(".meta.yaml")
        .to_string();
    meta_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vault() -> (tempfile::TempDir, VaultPaths) {
        let dir = tempdir().expect("tempdir");
        let vault = VaultPaths::new(dir.path().join("vault"));
        vault.initialize().expect("init");
        (dir, vault)
    }

    #[test]
    fn admit_then_retry_round_trips_the_file() {
        let (_dir, vault) = vault();
        let source = vault.folder("Failed").join("abc.plan.md");
        fs::write(&source, b"plan body").expect("seed");

        let dlq = DeadLetterQueue::new(vault.clone());
        let meta = dlq
            .admit(
                "abc.plan.md",
                WorkflowState::Failed,
                "step 1 exploded",
                5,
                "corr-1",
                serde_json::json!({"note": "test"}),
            )
            .expect("admit");

        assert!(!source.exists(), "admission must move the file");
        assert_eq!(dlq.len(), 1);

        let restored = dlq.retry(&meta.dlq_id).expect("retry");
        assert_eq!(restored, source);
        assert_eq!(fs::read_to_string(&source).expect("read"), "plan body");
        assert_eq!(dlq.len(), 0, "retry must remove the DLQ pair");
    }

    #[test]
    fn entries_report_recorded_failure_metadata() {
        let (_dir, vault) = vault();
        fs::write(vault.folder("Failed").join("x.action.yaml"), b"a").expect("seed");
        let dlq = DeadLetterQueue::new(vault);
        dlq.admit(
            "x.action.yaml",
            WorkflowState::Failed,
            "permission denied",
            3,
            "corr-9",
            serde_json::Value::Null,
        )
        .expect("admit");

        let entries = dlq.entries(10).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error, "permission denied");
        assert_eq!(entries[0].attempts, 3);
        assert_eq!(entries[0].source_state, WorkflowState::Failed);
    }

    #[test]
    fn purge_removes_only_old_entries() {
        let (_dir, vault) = vault();
        fs::write(vault.folder("Failed").join("y.plan.md"), b"a").expect("seed");
        let dlq = DeadLetterQueue::new(vault);
        dlq.admit(
            "y.plan.md",
            WorkflowState::Failed,
            "err",
            1,
            "corr",
            serde_json::Value::Null,
        )
        .expect("admit");

        assert_eq!(dlq.purge(1).expect("purge"), 0, "fresh entries survive");
        assert_eq!(dlq.purge(0).expect("purge"), 1, "cutoff now removes them");
        assert_eq!(dlq.len(), 0);
    }
}
