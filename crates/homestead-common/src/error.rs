//! Centralized error types for homestead.
//!
//! Every failure the reconciler can report is a [`ReconcileError`]. Duplicate
//! rows are deliberately absent: they are a skip outcome, not an error.

/// Error returned by every fallible reconciliation step.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    // === Local errors (raised before any network I/O) ===
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Seed record #{position} is invalid: {message}")]
    InvalidRecord { position: usize, message: String },

    // === Remote errors ===
    #[error("Connection to {endpoint} failed: {message}")]
    Connection {
        endpoint: String,
        message: String,
        hint: String,
    },

    #[error("Table '{table}' does not exist")]
    TableMissing { table: String, ddl: String },

    #[error("{operation} is not available through the {channel} channel")]
    Unsupported { channel: String, operation: String },

    #[error("Seed record #{position} ('{title}') was rejected: {detail}")]
    RecordRejected {
        position: usize,
        title: String,
        detail: String,
    },

    #[error("Unexpected server error while {context}: {detail}")]
    UnexpectedServer { context: String, detail: String },
}

impl ReconcileError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unexpected(context: impl Into<String>, detail: impl ToString) -> Self {
        Self::UnexpectedServer {
            context: context.into(),
            detail: detail.to_string(),
        }
    }

    /// Error code string, stable across releases.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::InvalidRecord { .. } => "INVALID_RECORD",
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::TableMissing { .. } => "TABLE_MISSING",
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::RecordRejected { .. } | Self::UnexpectedServer { .. } => {
                "UNEXPECTED_SERVER_ERROR"
            }
        }
    }

    /// Human-readable follow-up for the operator, when there is one.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::Configuration { .. } => Some(
                "Set HOMESTEAD_DATABASE__URL (or DATABASE_URL) for the SQL channel, or\n\
                 HOMESTEAD_REST__URL and HOMESTEAD_REST__SERVICE_ROLE_KEY for the REST channel.\n\
                 A .env file in the working directory is loaded automatically."
                    .to_string(),
            ),
            Self::Connection { hint, .. } => Some(hint.clone()),
            Self::TableMissing { ddl, .. } => Some(format!(
                "Run the following SQL in the database SQL editor, then run homestead again:\n\n{ddl}"
            )),
            Self::Unsupported { .. } => {
                Some("Re-run with --channel sql and database credentials.".to_string())
            }
            Self::InvalidRecord { .. }
            | Self::RecordRejected { .. }
            | Self::UnexpectedServer { .. } => None,
        }
    }
}

/// Convenience type alias for Results using ReconcileError.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
