//! Error types for the crmsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Record-level failures ([`MappingError`], per-record [`ConnectorError`]s)
//! never abort a cycle. Cycle-level failures ([`JobError::Timeout`], a failed
//! source fetch) abort only the current cycle and leave the watermark where
//! it was. [`WatermarkError::Regression`] indicates a clock or cursor defect.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Mapping errors
// ---------------------------------------------------------------------------

/// Errors from the field mapper and schema-checked record construction.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MappingError {
    /// A required field has no value and no default.
    #[error("required field '{field}' has no value and no default")]
    MissingRequiredField { field: String },

    /// A target field the destination requires is not produced by any rule.
    #[error("target field '{0}' is required but no mapping rule produces it")]
    UnmappedTargetField(String),

    /// A field that the mapping schema does not declare.
    #[error("field '{0}' is not declared by the mapping")]
    UnknownField(String),

    /// Two rules write the same target field.
    #[error("target field '{0}' is produced by more than one rule")]
    DuplicateTarget(String),
}

// ---------------------------------------------------------------------------
// Connector errors
// ---------------------------------------------------------------------------

/// Errors raised by source and target connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// A failure that is expected to go away on retry (throttling, outage).
    #[error("transient connector error: {0}")]
    Transient(String),

    /// A failure that will not succeed on retry (validation, permissions).
    #[error("connector error: {0}")]
    Permanent(String),

    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// HTTP-level transport error (network, TLS, etc.).
    #[error("connector HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote system answered with a body we could not decode.
    #[error("connector response parse error: {0}")]
    Parse(String),
}

impl ConnectorError {
    /// Whether the next poll cycle may reasonably succeed where this failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Permanent(_) | Self::NotFound(_) | Self::Parse(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch job errors
// ---------------------------------------------------------------------------

/// Errors from the batch job runner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The job did not reach a terminal state before the deadline. The job
    /// itself keeps running.
    #[error("batch job {job_id} did not terminate within {waited_ms}ms")]
    Timeout { job_id: String, waited_ms: u64 },
}

// ---------------------------------------------------------------------------
// Watermark errors
// ---------------------------------------------------------------------------

/// Errors from the watermark store.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// An advance would move the watermark backwards.
    #[error("watermark regression on stream '{stream}': current {current}, attempted {attempted}")]
    Regression {
        stream: String,
        current: String,
        attempted: String,
    },

    /// A default-watermark expression could not be parsed.
    #[error("invalid watermark expression '{0}'")]
    InvalidExpression(String),

    /// A persisted watermark value is not a valid timestamp.
    #[error("stored watermark for stream '{stream}' is corrupt: {value}")]
    Corrupt { stream: String, value: String },

    /// Underlying persistence failure.
    #[error("watermark database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Sync orchestrator errors
// ---------------------------------------------------------------------------

/// Cycle-level errors from the sync orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another cycle for this stream is already running.
    #[error("sync already in progress for stream '{stream}'")]
    AlreadyRunning { stream: String },

    /// Fetching changed records from the source failed.
    #[error("sync source error: {0}")]
    Source(#[from] ConnectorError),

    /// Waiting for the batch job failed.
    #[error("sync job error: {0}")]
    Job(#[from] JobError),

    /// Reading or advancing the watermark failed.
    #[error("sync watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Recording the run failed.
    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

/// Errors from the poller state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// A state-machine transition was invalid.
    #[error("invalid poller state transition from {from} via {operation}")]
    InvalidTransition { from: String, operation: String },

    /// Interval must be non-zero.
    #[error("poll interval must be greater than zero")]
    ZeroInterval,
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = MappingError::MissingRequiredField {
            field: "lastname".into(),
        };
        assert_eq!(
            err.to_string(),
            "required field 'lastname' has no value and no default"
        );

        let err = JobError::Timeout {
            job_id: "job-1".into(),
            waited_ms: 500,
        };
        assert_eq!(
            err.to_string(),
            "batch job job-1 did not terminate within 500ms"
        );

        let err = WatermarkError::Regression {
            stream: "contacts".into(),
            current: "2025-01-02T00:00:00.000Z".into(),
            attempted: "2025-01-01T00:00:00.000Z".into(),
        };
        assert!(err.to_string().contains("regression"));

        let err = ConfigError::EnvVarMissing {
            var: "TARGET_TOKEN".into(),
            field: "target.token_env".into(),
        };
        assert!(err.to_string().contains("TARGET_TOKEN"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ConnectorError::Transient("throttled".into()).is_transient());
        assert!(!ConnectorError::Permanent("bad field".into()).is_transient());
        assert!(!ConnectorError::NotFound("abc".into()).is_transient());
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = JobError::Timeout {
            job_id: "j".into(),
            waited_ms: 1,
        }
        .into();
        assert!(matches!(err, CoreError::Job(_)));

        let sync: SyncError = ConnectorError::Transient("down".into()).into();
        assert!(matches!(sync, SyncError::Source(_)));
        let err: CoreError = sync.into();
        assert!(matches!(err, CoreError::Sync(_)));
    }
}
