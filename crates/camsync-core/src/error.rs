//! Error types for camsync-core
//!
//! Every component reports failure as a typed value; the orchestrator is the
//! single place that decides whether a given condition aborts the session.

use thiserror::Error;

use crate::resolver::PatientRejection;
use crate::transport::RecordFailure;

/// Result type alias using camsync-core's `SyncError`
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during a synchronization session
#[derive(Error, Debug)]
pub enum SyncError {
    /// Missing or invalid configuration; fails before any network call
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection, TLS, or timeout failure
    #[error("Network failure: {0}")]
    Network(#[from] reqwest::Error),

    /// Reply not recognizable as a valid server reply, or missing expected keys
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server processed the request and reported failure
    #[error("Server reported an error: {0}")]
    Server(String),

    /// Device has never registered, or the server does not know it
    #[error("Device is not registered with the server; re-register and retry")]
    NotRegistered,

    /// A server-supplied ID policy could not be parsed
    #[error("Invalid ID policy ({context}): {text:?}")]
    InvalidPolicy { context: String, text: String },

    /// A non-empty table cannot be uploaded without risking data loss
    #[error("Table '{table}' contains data but cannot be uploaded: {reason}")]
    IncompatibleTable { table: String, reason: String },

    /// One or more patients failed validation before any transfer began
    #[error("{} patient(s) failed validation: {}", .0.len(), format_rejections(.0))]
    PatientsRejected(Vec<PatientRejection>),

    /// Recordwise upload exhausted a table with individual record failures
    #[error("Upload of table '{table}' failed for {} record(s)", .failures.len())]
    RecordsRejected {
        table: String,
        failures: Vec<RecordFailure>,
    },

    /// Local database error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// User-initiated abort, observed at a state boundary
    #[error("Sync aborted by user")]
    Aborted,
}

impl SyncError {
    /// Whether re-invoking the sync without changing anything could succeed.
    ///
    /// Configuration and policy/version problems need correcting first;
    /// network hiccups and server-side errors are worth retrying as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Server(_) | Self::Aborted | Self::RecordsRejected { .. }
        )
    }
}

fn format_rejections(rejections: &[PatientRejection]) -> String {
    rejections
        .iter()
        .map(PatientRejection::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
