pub mod entry;
pub mod log;

pub use entry::{AuditEntry, AuditEntryDraft};
pub use log::{AuditLog, AuditQuery, AuditStats, ChainVerification};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid audit entry in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("audit chain integrity broken at seq {seq}; appends refused until reset")]
    IntegrityBroken { seq: u64 },
}
