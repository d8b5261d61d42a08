/// Closed failure taxonomy for the pipeline. Foreign faults (OS, adapter)
/// are translated into one of these kinds at the boundary where they occur;
/// raw `std::io::Error` values never cross the transition boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("source file not found: {path}")]
    FileNotFound { path: String },
    #[error("target already exists: {path}")]
    TargetExists { path: String },
    #[error("failed to acquire lock for stem {stem} within {waited_ms}ms")]
    LockTimeout { stem: String, waited_ms: u64 },
    #[error("claimed stale lock for stem {stem}")]
    LockStale { stem: String },
    #[error("atomic move failed at {path}: {source}")]
    MoveFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("schema-invalid file {path}: {reason}")]
    SchemaInvalid { path: String, reason: String },
    #[error("step {index} exceeded deadline of {deadline_ms}ms")]
    StepTimeout { index: usize, deadline_ms: u64 },
    #[error("step {index} failed: {reason}")]
    StepFailed {
        index: usize,
        reason: String,
        fatal: bool,
    },
    #[error("rollback of step {index} failed: {reason}")]
    RollbackFailed { index: usize, reason: String },
    #[error("subscriber {subscriber} queue overflowed")]
    BusOverflow { subscriber: String },
    #[error("health probe for {service} exceeded {timeout_ms}ms")]
    HealthTimeout { service: String, timeout_ms: u64 },
    #[error("audit chain integrity broken at seq {seq}")]
    IntegrityBroken { seq: u64 },
    #[error("credential {name} is missing or expired")]
    CredentialMissing { name: String },
}

impl PipelineError {
    /// Stable kind tag used in audit details and bus payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::FileNotFound { .. } => "file_not_found",
            Self::TargetExists { .. } => "target_exists",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockStale { .. } => "lock_stale",
            Self::MoveFailed { .. } => "move_failed",
            Self::SchemaInvalid { .. } => "schema_invalid",
            Self::StepTimeout { .. } => "step_timeout",
            Self::StepFailed { .. } => "step_failed",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::BusOverflow { .. } => "bus_overflow",
            Self::HealthTimeout { .. } => "health_timeout",
            Self::IntegrityBroken { .. } => "integrity_broken",
            Self::CredentialMissing { .. } => "credential_missing",
        }
    }

    /// Whether a failed transition may be reattempted with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::MoveFailed { .. } => true,
            Self::StepFailed { fatal, .. } => !fatal,
            Self::StepTimeout { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read runtime state {path}: {source}")]
    ReadState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse runtime state {path}: {source}")]
    ParseState {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write runtime state {path}: {source}")]
    WriteState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("supervisor is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },
    #[error("no running supervisor instance")]
    NotRunning,
    #[error("failed to read lock file {path}: {source}")]
    ReadLock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write lock file {path}: {source}")]
    WriteLock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vault root {vault} and lock directory {locks} are on different filesystems")]
    SplitFilesystems { vault: String, locks: String },
    #[error("service {service} failed to start: {reason}")]
    ServiceStart { service: String, reason: String },
    #[error("failed to stop supervisor process {pid}; process is still alive")]
    StopFailedAlive { pid: u32 },
}
