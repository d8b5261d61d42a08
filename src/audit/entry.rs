use crate::shared::ids::new_uuid;
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One immutable line of the audit chain. Field order matters: the entry
/// hash covers the canonical serialization of everything except the two
/// hash fields.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuditEntry {
    pub seq: u64,
    pub entry_id: String,
    pub timestamp: String,
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub correlation_id: String,
    pub details: BTreeMap<String, serde_json::Value>,
    pub entry_hash: String,
    pub chain_hash: String,
}

/// Canonical form hashed into `entry_hash`: the entry without its hashes.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    seq: u64,
    entry_id: &'a str,
    timestamp: &'a str,
    event_type: &'a str,
    actor: &'a str,
    action: &'a str,
    resource: &'a str,
    resource_id: &'a str,
    correlation_id: &'a str,
    details: &'a BTreeMap<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn compute_entry_hash(&self) -> String {
        let canonical = CanonicalEntry {
            seq: self.seq,
            entry_id: &self.entry_id,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            actor: &self.actor,
            action: &self.action,
            resource: &self.resource,
            resource_id: &self.resource_id,
            correlation_id: &self.correlation_id,
            details: &self.details,
        };
        let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
        hex_sha256(&encoded)
    }

    pub fn compute_chain_hash(entry_hash: &str, prev_chain_hash: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_hash.as_bytes());
        if let Some(prev) = prev_chain_hash {
            hasher.update(prev.as_bytes());
        }
        hex_digest(hasher)
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Builder for an entry before it receives its sequence number and hashes.
#[derive(Debug, Clone)]
pub struct AuditEntryDraft {
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub correlation_id: String,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditEntryDraft {
    pub fn new(event_type: &str, actor: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            action: String::new(),
            resource: String::new(),
            resource_id: String::new(),
            correlation_id: String::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = action.to_string();
        self
    }

    pub fn resource(mut self, resource: &str, resource_id: &str) -> Self {
        self.resource = resource.to_string();
        self.resource_id = resource_id.to_string();
        self
    }

    pub fn correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }

    pub fn detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub(crate) fn into_entry(self, seq: u64, prev_chain_hash: Option<&str>) -> AuditEntry {
        let mut entry = AuditEntry {
            seq,
            entry_id: new_uuid(),
            timestamp: now_rfc3339(),
            event_type: self.event_type,
            actor: self.actor,
            action: self.action,
            resource: self.resource,
            resource_id: self.resource_id,
            correlation_id: self.correlation_id,
            details: self.details,
            entry_hash: String::new(),
            chain_hash: String::new(),
        };
        entry.entry_hash = entry.compute_entry_hash();
        entry.chain_hash = AuditEntry::compute_chain_hash(&entry.entry_hash, prev_chain_hash);
        entry
    }
}
