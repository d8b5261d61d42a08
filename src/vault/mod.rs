use crate::shared::fs_atomic::{atomic_write_file, same_filesystem};
use crate::shared::time::now_rfc3339;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const ACTION_SUFFIX: &str = ".action.yaml";
pub const PLAN_SUFFIX: &str = ".plan.md";
pub const APPROVAL_SUFFIX: &str = ".approval.md";

/// Pipeline folders in pipeline order, followed by the support folders.
pub const PIPELINE_FOLDERS: [&str; 11] = [
    "Inbox",
    "Needs_Action",
    "Plans",
    "Pending_Approval",
    "Approved",
    "Done",
    "Failed",
    "Rejected",
    "Retry",
    "Dead_Letter",
    "Archived",
];

pub const SUPPORT_FOLDERS: [&str; 5] = [
    "System_Log",
    "System_Log/Audit",
    ".locks",
    ".credentials",
    ".integrity",
];

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("failed to create vault folder {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read vault folder {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vault root {vault} and {other} are on different filesystems; atomic rename is not guaranteed")]
    SplitFilesystems { vault: String, other: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    pub root: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn folder(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join(".credentials")
    }

    pub fn integrity_dir(&self) -> PathBuf {
        self.root.join(".integrity")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("System_Log/Audit")
    }

    pub fn system_log_dir(&self) -> PathBuf {
        self.root.join("System_Log")
    }

    pub fn dashboard_file(&self) -> PathBuf {
        self.root.join("Dashboard.md")
    }

    pub fn open_contexts_file(&self) -> PathBuf {
        self.root.join("System_Log/open_contexts.json")
    }

    pub fn file_in(&self, folder: &str, stem: &str, suffix: &str) -> PathBuf {
        self.folder(folder).join(format!("{stem}{suffix}"))
    }

    /// Creates the directory tree and seeds Dashboard.md.
    pub fn initialize(&self) -> Result<(), VaultError> {
        for name in PIPELINE_FOLDERS.iter().chain(SUPPORT_FOLDERS.iter()) {
            let path = self.folder(name);
            fs::create_dir_all(&path).map_err(|source| VaultError::CreateDir {
                path: path.display().to_string(),
                source,
            })?;
        }
        let dashboard = self.dashboard_file();
        if !dashboard.exists() {
            let body = initial_dashboard();
            atomic_write_file(&dashboard, body.as_bytes()).map_err(|source| {
                VaultError::Write {
                    path: dashboard.display().to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        PIPELINE_FOLDERS
            .iter()
            .chain(SUPPORT_FOLDERS.iter())
            .all(|name| self.folder(name).is_dir())
    }

    /// Rename atomicity is a per-filesystem property; refuse to run when
    /// the vault and its lock directory straddle a mount boundary.
    pub fn check_single_filesystem(&self) -> Result<(), VaultError> {
        for other in [self.locks_dir(), self.audit_dir()] {
            let same = same_filesystem(&self.root, &other).unwrap_or(true);
            if !same {
                return Err(VaultError::SplitFilesystems {
                    vault: self.root.display().to_string(),
                    other: other.display().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn count_entries(&self, folder: &str) -> Result<usize, VaultError> {
        let path = self.folder(folder);
        let mut count = 0usize;
        let entries = fs::read_dir(&path).map_err(|source| VaultError::ReadDir {
            path: path.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| VaultError::ReadDir {
                path: path.display().to_string(),
                source,
            })?;
            if entry.path().is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn folder_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for name in PIPELINE_FOLDERS {
            counts.insert(name.to_string(), self.count_entries(name).unwrap_or(0));
        }
        counts
    }

    /// Files in a pipeline folder, oldest first by modification time with
    /// name as tie-breaker so concurrent pollers agree on order.
    pub fn sorted_entries(&self, folder: &str) -> Result<Vec<PathBuf>, VaultError> {
        let path = self.folder(folder);
        let mut entries = Vec::new();
        let reader = fs::read_dir(&path).map_err(|source| VaultError::ReadDir {
            path: path.display().to_string(),
            source,
        })?;
        for entry in reader {
            let entry = entry.map_err(|source| VaultError::ReadDir {
                path: path.display().to_string(),
                source,
            })?;
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, entry_path));
        }
        entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
            a_time
                .cmp(b_time)
                .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
        });
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }
}

fn initial_dashboard() -> String {
    let now = now_rfc3339();
    format!(
        "# Vaultflow Dashboard\n\n\
         ## System Status\n- **Active**: initialized\n- **Last Updated**: {now}\n\n\
         ## Pipeline\n- **Inbox**: 0\n- **Needs_Action**: 0\n- **Pending_Approval**: 0\n- **Done**: 0\n\n\
         ## Services\n- none registered yet\n\n\
         ## Recent Audit\n- vault initialized on {now}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initialize_creates_every_folder_and_dashboard() {
        let dir = tempdir().expect("tempdir");
        let vault = VaultPaths::new(dir.path().join("vault"));
        vault.initialize().expect("init");

        assert!(vault.exists());
        assert!(vault.dashboard_file().is_file());
        assert!(vault.locks_dir().is_dir());
        assert!(vault.audit_dir().is_dir());
    }

    #[test]
    fn folder_counts_see_only_files() {
        let dir = tempdir().expect("tempdir");
        let vault = VaultPaths::new(dir.path().join("vault"));
        vault.initialize().expect("init");

        std::fs::write(vault.folder("Inbox").join("a.txt"), b"x").expect("write");
        std::fs::create_dir(vault.folder("Inbox").join("sub")).expect("mkdir");

        let counts = vault.folder_counts();
        assert_eq!(counts.get("Inbox"), Some(&1));
        assert_eq!(counts.get("Done"), Some(&0));
    }

    #[test]
    fn single_filesystem_check_passes_within_one_tempdir() {
        let dir = tempdir().expect("tempdir");
        let vault = VaultPaths::new(dir.path().join("vault"));
        vault.initialize().expect("init");
        vault.check_single_filesystem().expect("same fs");
    }
}
