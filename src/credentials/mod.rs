use crate::audit::{AuditEntryDraft, AuditLog};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::time::{now_rfc3339, now_secs};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store is corrupt at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cipher failure: {reason}")]
    Cipher { reason: String },
    #[error("credential {name} is missing or expired")]
    Missing { name: String },
}

/// Authenticated symmetric cipher seam. The concrete primitive (and its
/// password-derived key) is an external collaborator; the store only ever
/// sees sealed bytes.
pub trait SecretCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, String>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct StoredSecret {
    ciphertext: String,
    #[serde(default)]
    expires_at: Option<String>,
    updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialInfo {
    pub name: String,
    pub expires_at: Option<String>,
    pub updated_at: String,
}

/// Encrypted key-value store under `.credentials/`. Every access is
/// audited; plaintext never reaches disk or the runtime log.
pub struct CredentialStore {
    path: PathBuf,
    cipher: Mutex<Box<dyn SecretCipher>>,
    audit: Arc<AuditLog>,
}

impl CredentialStore {
    pub fn open(
        credentials_dir: impl Into<PathBuf>,
        cipher: Box<dyn SecretCipher>,
        audit: Arc<AuditLog>,
    ) -> Result<Self, CredentialError> {
        let dir = credentials_dir.into();
        fs::create_dir_all(&dir).map_err(|source| CredentialError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            path: dir.join("credentials.json"),
            cipher: Mutex::new(cipher),
            audit,
        })
    }

    fn load(&self) -> Result<BTreeMap<String, StoredSecret>, CredentialError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| CredentialError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| CredentialError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn persist(&self, entries: &BTreeMap<String, StoredSecret>) -> Result<(), CredentialError> {
        let body = serde_json::to_vec_pretty(entries).map_err(|source| CredentialError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        atomic_write_file(&self.path, &body).map_err(|source| CredentialError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn record_access(&self, operation: &str, name: &str) {
        let _ = self.audit.append(
            AuditEntryDraft::new("credential.access", "credential_store")
                .action(operation)
                .resource("credential", name),
        );
    }

    pub fn get(&self, name: &str) -> Result<String, CredentialError> {
        self.record_access("get", name);
        let entries = self.load()?;
        let entry = entries.get(name).ok_or_else(|| CredentialError::Missing {
            name: name.to_string(),
        })?;
        if is_expired(entry.expires_at.as_deref()) {
            return Err(CredentialError::Missing {
                name: name.to_string(),
            });
        }
        let sealed = BASE64
            .decode(&entry.ciphertext)
            .map_err(|err| CredentialError::Cipher {
                reason: err.to_string(),
            })?;
        let cipher = self.cipher.lock().expect("cipher lock");
        let plaintext = cipher
            .open(&sealed)
            .map_err(|reason| CredentialError::Cipher { reason })?;
        String::from_utf8(plaintext).map_err(|err| CredentialError::Cipher {
            reason: err.to_string(),
        })
    }

    pub fn set(
        &self,
        name: &str,
        value: &str,
        expires_at: Option<String>,
    ) -> Result<(), CredentialError> {
        self.record_access("set", name);
        let sealed = {
            let cipher = self.cipher.lock().expect("cipher lock");
            cipher
                .seal(value.as_bytes())
                .map_err(|reason| CredentialError::Cipher { reason })?
        };
        let mut entries = self.load()?;
        entries.insert(
            name.to_string(),
            StoredSecret {
                ciphertext: BASE64.encode(sealed),
                expires_at,
                updated_at: now_rfc3339(),
            },
        );
        self.persist(&entries)
    }

    /// Re-seals every secret under a new master cipher and rewrites the
    /// store atomically.
    pub fn rotate(&self, new_cipher: Box<dyn SecretCipher>) -> Result<usize, CredentialError> {
        let entries = self.load()?;
        let mut cipher = self.cipher.lock().expect("cipher lock");
        let mut rotated = BTreeMap::new();
        for (name, entry) in &entries {
            let sealed = BASE64
                .decode(&entry.ciphertext)
                .map_err(|err| CredentialError::Cipher {
                    reason: err.to_string(),
                })?;
            let plaintext = cipher
                .open(&sealed)
                .map_err(|reason| CredentialError::Cipher { reason })?;
            let resealed = new_cipher
                .seal(&plaintext)
                .map_err(|reason| CredentialError::Cipher { reason })?;
            rotated.insert(
                name.clone(),
                StoredSecret {
                    ciphertext: BASE64.encode(resealed),
                    expires_at: entry.expires_at.clone(),
                    updated_at: now_rfc3339(),
                },
            );
        }
        self.persist(&rotated)?;
        *cipher = new_cipher;
        let _ = self.audit.append(
            AuditEntryDraft::new("credential.rotated", "credential_store")
                .action("rotate")
                .detail("count", json!(rotated.len())),
        );
        Ok(rotated.len())
    }

    pub fn list(&self) -> Result<Vec<CredentialInfo>, CredentialError> {
        self.record_access("list", "*");
        Ok(self
            .load()?
            .into_iter()
            .map(|(name, entry)| CredentialInfo {
                name,
                expires_at: entry.expires_at,
                updated_at: entry.updated_at,
            })
            .collect())
    }
}

fn is_expired(expires_at: Option<&str>) -> bool {
    let Some(raw) = expires_at else {
        return false;
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.timestamp() <= now_secs())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use tempfile::tempdir;

    /// Placeholder cipher for tests; production wires an authenticated
    /// AEAD behind the same trait.
    struct XorCipher(u8);

    impl SecretCipher for XorCipher {
        fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, String> {
            Ok(plaintext.iter().map(|b| b ^ self.0).collect())
        }

        fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, String> {
            Ok(sealed.iter().map(|b| b ^ self.0).collect())
        }
    }

    fn store(dir: &std::path::Path) -> CredentialStore {
        let audit = Arc::new(
            AuditLog::open(&dir.join("audit.jsonl"), &dir.join(".integrity")).expect("audit"),
        );
        CredentialStore::open(dir.join(".credentials"), Box::new(XorCipher(0x5a)), audit)
            .expect("store")
    }

    #[test]
    fn set_get_round_trip_never_stores_plaintext() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store.set("gmail_token", "s3cret-value", None).expect("set");

        assert_eq!(store.get("gmail_token").expect("get"), "s3cret-value");

        let on_disk =
            fs::read_to_string(dir.path().join(".credentials/credentials.json")).expect("read");
        assert!(!on_disk.contains("s3cret-value"));
    }

    #[test]
    fn expired_secrets_surface_as_missing() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store
            .set(
                "old_token",
                "value",
                Some("2000-01-01T00:00:00Z".to_string()),
            )
            .expect("set");
        assert!(matches!(
            store.get("old_token"),
            Err(CredentialError::Missing { .. })
        ));
    }

    #[test]
    fn rotation_reseals_under_the_new_master() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store.set("api_key", "k-123", None).expect("set");

        let rotated = store.rotate(Box::new(XorCipher(0x77))).expect("rotate");
        assert_eq!(rotated, 1);
        assert_eq!(store.get("api_key").expect("get"), "k-123");
    }

    #[test]
    fn accesses_append_audit_entries() {
        let dir = tempdir().expect("tempdir");
        let audit = Arc::new(
            AuditLog::open(&dir.path().join("audit.jsonl"), &dir.path().join(".integrity"))
                .expect("audit"),
        );
        let store = CredentialStore::open(
            dir.path().join(".credentials"),
            Box::new(XorCipher(1)),
            Arc::clone(&audit),
        )
        .expect("store");
        store.set("slack_token", "hunter2", None).expect("set");
        let _ = store.get("slack_token");

        let entries = audit
            .query(&crate::audit::AuditQuery {
                event_type: Some("credential.access".to_string()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(entries.len(), 2);
        for entry in entries {
            let encoded = serde_json::to_string(&entry).expect("json");
            assert!(!encoded.contains("hunter2"), "plaintext leaked into audit");
        }
    }
}
