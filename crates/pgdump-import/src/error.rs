//! Error types for the import engine.

use thiserror::Error;

/// Main error type for import operations.
///
/// Statement failures reported by the database are not errors at this level;
/// they are recorded as [`crate::session::ImportError`] entries on the session.
#[derive(Error, Debug)]
pub enum DumpImportError {
    /// Configuration error (invalid YAML, missing fields, out-of-range options)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The target database could not be reached or refused the session
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Driver-level database error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Execution channel failed outside of any single statement
    #[error("Execution channel error: {0}")]
    Channel(String),

    /// A lifecycle operation was requested in a state that does not allow it
    #[error("Cannot {operation} while import is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// The dump has integrity errors that must be repaired or overridden first
    #[error("Import blocked by integrity errors: {0}")]
    IntegrityBlocked(String),

    /// Schema alignment could not introspect or change the target
    #[error("Schema alignment failed: {0}")]
    Alignment(String),

    /// Rollback of alignment changes failed
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Import was cancelled
    #[error("Import cancelled")]
    Cancelled,
}

impl DumpImportError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        DumpImportError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create an InvalidState error for a rejected lifecycle transition
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        DumpImportError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Whether the error means the target database cannot be used at all.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            DumpImportError::Connection(_) | DumpImportError::Pool { .. }
        )
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, DumpImportError>;
