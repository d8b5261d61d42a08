use super::entry::{AuditEntry, AuditEntryDraft};
use super::AuditError;
use crate::shared::fs_atomic::atomic_write_file;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub total_entries: u64,
    pub approval_events: u64,
    pub execution_events: u64,
    pub rejections: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub correlation_id: Option<String>,
    pub actor: Option<String>,
    pub event_type: Option<String>,
    pub from_timestamp: Option<String>,
    pub to_timestamp: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: u64,
    pub invalid_entries: u64,
    pub first_invalid_seq: Option<u64>,
    pub issues: Vec<String>,
}

struct LogState {
    next_seq: u64,
    prev_chain_hash: Option<String>,
    sidecar: BTreeMap<u64, String>,
    broken_at: Option<u64>,
    stats: AuditStats,
}

/// Append-only hash-chained JSONL log. All writers funnel through the one
/// internal lock, which is what makes `seq` a total order.
pub struct AuditLog {
    log_path: PathBuf,
    sidecar_path: PathBuf,
    latch_path: PathBuf,
    state: Mutex<LogState>,
}

impl AuditLog {
    /// Opens (or creates) the log, scanning existing entries to recover the
    /// chain head, sidecar, and statistics.
    pub fn open(log_path: &Path, integrity_dir: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::create_dir_all(integrity_dir).map_err(|source| AuditError::Io {
            path: integrity_dir.display().to_string(),
            source,
        })?;

        let sidecar_path = log_path
            .parent()
            .map(|p| p.join("chain_hashes.json"))
            .unwrap_or_else(|| PathBuf::from("chain_hashes.json"));
        let latch_path = integrity_dir.join("audit_chain_broken");

        let mut state = LogState {
            next_seq: 1,
            prev_chain_hash: None,
            sidecar: BTreeMap::new(),
            broken_at: None,
            stats: AuditStats::default(),
        };

        for entry in read_entries(log_path)? {
            state.next_seq = entry.seq + 1;
            state.prev_chain_hash = Some(entry.chain_hash.clone());
            state.sidecar.insert(entry.seq, entry.chain_hash.clone());
            update_stats(&mut state.stats, &entry.event_type);
        }

        if latch_path.exists() {
            let raw = fs::read_to_string(&latch_path).map_err(|source| AuditError::Io {
                path: latch_path.display().to_string(),
                source,
            })?;
            state.broken_at = raw.trim().parse::<u64>().ok().or(Some(0));
        }

        Ok(Self {
            log_path: log_path.to_path_buf(),
            sidecar_path,
            latch_path,
            state: Mutex::new(state),
        })
    }

    pub fn append(&self, draft: AuditEntryDraft) -> Result<AuditEntry, AuditError> {
        let mut state = self.state.lock().expect("audit writer lock");
        if let Some(seq) = state.broken_at {
            return Err(AuditError::IntegrityBroken { seq });
        }

        let entry = draft.into_entry(state.next_seq, state.prev_chain_hash.as_deref());
        let line = serde_json::to_string(&entry).map_err(|source| AuditError::Parse {
            path: self.log_path.display().to_string(),
            source,
        })?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| AuditError::Io {
                path: self.log_path.display().to_string(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| AuditError::Io {
            path: self.log_path.display().to_string(),
            source,
        })?;
        file.sync_all().map_err(|source| AuditError::Io {
            path: self.log_path.display().to_string(),
            source,
        })?;

        state.next_seq = entry.seq + 1;
        state.prev_chain_hash = Some(entry.chain_hash.clone());
        state.sidecar.insert(entry.seq, entry.chain_hash.clone());
        update_stats(&mut state.stats, &entry.event_type);
        self.write_sidecar(&state.sidecar)?;

        Ok(entry)
    }

    fn write_sidecar(&self, sidecar: &BTreeMap<u64, String>) -> Result<(), AuditError> {
        let body = serde_json::to_vec_pretty(sidecar).map_err(|source| AuditError::Parse {
            path: self.sidecar_path.display().to_string(),
            source,
        })?;
        atomic_write_file(&self.sidecar_path, &body).map_err(|source| AuditError::Io {
            path: self.sidecar_path.display().to_string(),
            source,
        })
    }

    /// Recomputes both hashes for every entry. The first mismatch marks the
    /// chain broken; the latch persists so a restart stays refused.
    pub fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let entries = read_entries(&self.log_path)?;
        let mut verification = ChainVerification {
            valid: true,
            total_entries: entries.len() as u64,
            invalid_entries: 0,
            first_invalid_seq: None,
            issues: Vec::new(),
        };

        let mut prev_chain_hash: Option<String> = None;
        let mut expected_seq = 1u64;
        for entry in &entries {
            let mut bad = false;
            if entry.seq != expected_seq {
                verification
                    .issues
                    .push(format!("seq {} expected {expected_seq}", entry.seq));
                bad = true;
            }
            let entry_hash = entry.compute_entry_hash();
            if entry_hash != entry.entry_hash {
                verification
                    .issues
                    .push(format!("seq {} entry_hash mismatch", entry.seq));
                bad = true;
            }
            let chain_hash =
                AuditEntry::compute_chain_hash(&entry.entry_hash, prev_chain_hash.as_deref());
            if chain_hash != entry.chain_hash {
                verification
                    .issues
                    .push(format!("seq {} chain_hash mismatch", entry.seq));
                bad = true;
            }
            if bad {
                verification.invalid_entries += 1;
                if verification.first_invalid_seq.is_none() {
                    verification.first_invalid_seq = Some(entry.seq);
                }
            }
            prev_chain_hash = Some(entry.chain_hash.clone());
            expected_seq = entry.seq + 1;
        }

        verification.valid = verification.invalid_entries == 0;
        if let Some(seq) = verification.first_invalid_seq {
            self.mark_broken(seq)?;
        }
        Ok(verification)
    }

    fn mark_broken(&self, seq: u64) -> Result<(), AuditError> {
        let mut state = self.state.lock().expect("audit writer lock");
        state.broken_at = Some(seq);
        atomic_write_file(&self.latch_path, seq.to_string().as_bytes()).map_err(|source| {
            AuditError::Io {
                path: self.latch_path.display().to_string(),
                source,
            }
        })
    }

    /// Operator acknowledgement after repairing or archiving a tampered
    /// log; clears the latch and re-reads the chain head.
    pub fn reset_integrity(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock().expect("audit writer lock");
        if self.latch_path.exists() {
            fs::remove_file(&self.latch_path).map_err(|source| AuditError::Io {
                path: self.latch_path.display().to_string(),
                source,
            })?;
        }
        state.broken_at = None;
        let entries = read_entries(&self.log_path)?;
        state.next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);
        state.prev_chain_hash = entries.last().map(|e| e.chain_hash.clone());
        Ok(())
    }

    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let limit = if query.limit == 0 { 100 } else { query.limit };
        let entries = read_entries(&self.log_path)?;
        let mut results = Vec::new();
        for entry in entries.into_iter().rev() {
            if results.len() >= limit {
                break;
            }
            if let Some(correlation_id) = &query.correlation_id {
                if &entry.correlation_id != correlation_id {
                    continue;
                }
            }
            if let Some(actor) = &query.actor {
                if &entry.actor != actor {
                    continue;
                }
            }
            if let Some(event_type) = &query.event_type {
                if &entry.event_type != event_type {
                    continue;
                }
            }
            if let Some(from) = &query.from_timestamp {
                if entry.timestamp.as_str() < from.as_str() {
                    continue;
                }
            }
            if let Some(to) = &query.to_timestamp {
                if entry.timestamp.as_str() > to.as_str() {
                    continue;
                }
            }
            results.push(entry);
        }
        Ok(results)
    }

    /// Newest `limit` entries, oldest first, for the dashboard tail.
    pub fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = read_entries(&self.log_path)?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Portable export: entries plus the terminal chain hash, enough for an
    /// external party to re-verify the whole chain.
    pub fn export(&self) -> Result<serde_json::Value, AuditError> {
        let entries = read_entries(&self.log_path)?;
        let terminal = entries.last().map(|e| e.chain_hash.clone());
        Ok(serde_json::json!({
            "format": "vaultflow-audit-export-v1",
            "total_entries": entries.len(),
            "terminal_chain_hash": terminal,
            "entries": entries,
        }))
    }

    pub fn stats(&self) -> AuditStats {
        self.state.lock().expect("audit writer lock").stats.clone()
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().expect("audit writer lock").broken_at.is_some()
    }

    /// Flushes are performed per append; shutdown only needs the sidecar
    /// to be current, which append also guarantees. Kept as an explicit
    /// hook for the orchestrator's shutdown sequence.
    pub fn flush(&self) -> Result<(), AuditError> {
        let state = self.state.lock().expect("audit writer lock");
        self.write_sidecar(&state.sidecar)
    }
}

fn read_entries(log_path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(log_path).map_err(|source| AuditError::Io {
        path: log_path.display().to_string(),
        source,
    })?;
    let mut entries = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: AuditEntry =
            serde_json::from_str(trimmed).map_err(|source| AuditError::Parse {
                path: log_path.display().to_string(),
                source,
            })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn update_stats(stats: &mut AuditStats, event_type: &str) {
    stats.total_entries += 1;
    if event_type.starts_with("approval.") {
        stats.approval_events += 1;
        if event_type == "approval.rejected" || event_type == "approval.auto_reject" {
            stats.rejections += 1;
        }
    }
    if event_type.starts_with("execution.") || event_type.starts_with("step.") {
        stats.execution_events += 1;
    }
    if event_type.starts_with("rollback.") {
        stats.rollbacks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_log(root: &Path) -> AuditLog {
        AuditLog::open(&root.join("audit/immutable_audit.jsonl"), &root.join(".integrity"))
            .expect("open log")
    }

    #[test]
    fn appends_are_sequenced_and_chained() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());

        let first = log
            .append(AuditEntryDraft::new("transition.completed", "engine"))
            .expect("append");
        let second = log
            .append(AuditEntryDraft::new("transition.completed", "engine"))
            .expect("append");

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(
            second.chain_hash,
            AuditEntry::compute_chain_hash(&second.entry_hash, Some(&first.chain_hash))
        );

        let verification = log.verify_chain().expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.total_entries, 2);
    }

    #[test]
    fn chain_head_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let log = open_log(dir.path());
            log.append(AuditEntryDraft::new("a", "x")).expect("append");
        }
        let log = open_log(dir.path());
        let entry = log.append(AuditEntryDraft::new("b", "x")).expect("append");
        assert_eq!(entry.seq, 2);
        assert!(log.verify_chain().expect("verify").valid);
    }

    #[test]
    fn tamper_is_detected_and_latches_appends() {
        let dir = tempdir().expect("tempdir");
        let log_path = dir.path().join("audit/immutable_audit.jsonl");
        let log = open_log(dir.path());
        for _ in 0..3 {
            log.append(AuditEntryDraft::new("transition.completed", "engine"))
                .expect("append");
        }

        // Flip one byte inside the second entry's actor field.
        let raw = fs::read_to_string(&log_path).expect("read");
        let tampered: Vec<String> = raw
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 1 {
                    line.replace("engine", "enginX")
                } else {
                    line.to_string()
                }
            })
            .collect();
        fs::write(&log_path, tampered.join("\n") + "\n").expect("write");

        let verification = log.verify_chain().expect("verify");
        assert!(!verification.valid);
        assert_eq!(verification.first_invalid_seq, Some(2));

        let err = log
            .append(AuditEntryDraft::new("transition.completed", "engine"))
            .expect_err("append must refuse");
        assert!(matches!(err, AuditError::IntegrityBroken { seq: 2 }));

        // The latch survives reopening until an operator reset.
        let reopened = open_log(dir.path());
        assert!(reopened.is_broken());
    }

    #[test]
    fn query_filters_by_actor_and_correlation() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        log.append(
            AuditEntryDraft::new("transition.completed", "engine").correlation("corr-1"),
        )
        .expect("append");
        log.append(AuditEntryDraft::new("approval.required", "approval").correlation("corr-2"))
            .expect("append");

        let by_actor = log
            .query(&AuditQuery {
                actor: Some("approval".to_string()),
                ..AuditQuery::default()
            })
            .expect("query");
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].event_type, "approval.required");

        let by_corr = log
            .query(&AuditQuery {
                correlation_id: Some("corr-1".to_string()),
                ..AuditQuery::default()
            })
            .expect("query");
        assert_eq!(by_corr.len(), 1);
    }

    #[test]
    fn export_carries_terminal_chain_hash() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        log.append(AuditEntryDraft::new("a", "x")).expect("append");
        let last = log.append(AuditEntryDraft::new("b", "x")).expect("append");

        let export = log.export().expect("export");
        assert_eq!(
            export["terminal_chain_hash"].as_str(),
            Some(last.chain_hash.as_str())
        );
        assert_eq!(export["total_entries"].as_u64(), Some(2));
    }
}
