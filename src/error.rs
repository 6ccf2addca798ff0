//! Error types for the sql-query-assistant library.
//!
//! Each component boundary has its own `thiserror` enum. Pipeline failures are
//! reported as [`QueryError`], which carries the stage the request was in and
//! the time spent up to that point.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::{RejectReason, RequestState, RequestTrace};

/// Errors raised while loading or introspecting the schema catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Descriptor file could not be read
    #[error("Failed to read schema descriptor {path}: {source}")]
    Read {
        /// Descriptor path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Descriptor file is not valid JSON/YAML of the expected shape
    #[error("Invalid schema descriptor: {0}")]
    Parse(String),

    /// Live metadata query failed
    #[error("Schema introspection failed: {0}")]
    Introspection(#[from] rusqlite::Error),

    /// Two tables share a name
    #[error("Duplicate table in catalog: {0}")]
    DuplicateTable(String),
}

/// Errors raised by an embedder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// The embedding service could not be reached or refused the request
    #[error("Embedding service unavailable: {0}")]
    Unavailable(String),

    /// The service returned a vector of the wrong length
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension {
        /// Configured dimension
        expected: usize,
        /// Returned dimension
        actual: usize,
    },

    /// The response body could not be understood
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by the schema vector cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// No fresh or last-known-good vector exists for a table
    #[error("Cache unavailable for table {table}: {reason}")]
    Unavailable {
        /// Table name
        table: String,
        /// Why no vector could be produced
        reason: String,
    },

    /// The embedded store failed
    #[error("Cache store error: {0}")]
    Store(#[from] sled::Error),

    /// A stored entry could not be encoded or decoded
    #[error("Cache entry encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Errors raised by the completion service client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// Network failure, server error or rate limiting
    #[error("Transient completion failure: {0}")]
    Transient(String),

    /// A single call exceeded its timeout
    #[error("Completion call timed out after {0:?}")]
    Timeout(Duration),

    /// The credential was refused
    #[error("Completion service rejected the credential: {0}")]
    Auth(String),

    /// The account has no remaining quota
    #[error("Completion quota exhausted: {0}")]
    Quota(String),

    /// The response did not have the expected shape
    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),
}

impl CompletionError {
    /// Only transient failures and timeouts are worth another attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors raised by the connection manager
#[derive(Error, Debug)]
pub enum PoolError {
    /// No connection became available within the timeout
    #[error("Connection pool exhausted after {timeout:?}{}", last_error_suffix(.last_error))]
    Exhausted {
        /// Time waited
        timeout: Duration,
        /// Last connection error reported by the pool, if any
        last_error: Option<String>,
    },

    /// The pool could not be constructed
    #[error("Failed to build connection pool: {0}")]
    Build(String),

    /// The data source could not be prepared
    #[error("Failed to prepare data source: {0}")]
    Setup(#[from] rusqlite::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// Errors raised while running a statement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The statement ran past the query timeout and was interrupted
    #[error("Statement exceeded the {0:?} query timeout")]
    Timeout(Duration),

    /// The driver reported an error
    #[error("Statement execution failed: {0}")]
    Failed(String),
}

/// Failure kinds reported to callers of the pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// The question itself was refused
    #[error("invalid question: {0}")]
    InvalidQuestion(String),

    /// No table vectors could be produced
    #[error("schema cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The completion service failed after retries
    #[error("completion service error: {0}")]
    GenerationServiceError(String),

    /// The model response did not contain exactly one statement
    #[error("model response did not contain exactly one SQL statement")]
    NoSingleStatement,

    /// The statement gate refused the statement
    #[error("statement rejected: {0}")]
    ValidationRejected(RejectReason),

    /// No connection within the acquire timeout
    #[error("{0}")]
    PoolExhausted(String),

    /// The statement ran past the query timeout
    #[error("statement timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// The driver reported an error
    #[error("statement execution failed: {0}")]
    ExecutionFailed(String),
}

/// A pipeline failure with its stage and elapsed time
#[derive(Error, Debug, Clone)]
#[error("{kind} (stage: {stage}, after {} ms)", .elapsed.as_millis())]
pub struct QueryError {
    /// Stage the request was in when it failed
    pub stage: RequestState,
    /// Time spent until the failure
    pub elapsed: Duration,
    /// What went wrong
    pub kind: ErrorKind,
    /// Generated statement, when generation got that far
    pub sql: Option<String>,
    /// State transitions up to and including the terminal one
    pub trace: RequestTrace,
}

impl QueryError {
    /// Terminal state implied by the failure kind
    #[must_use]
    pub const fn terminal_state(&self) -> RequestState {
        match self.kind {
            ErrorKind::InvalidQuestion(_)
            | ErrorKind::NoSingleStatement
            | ErrorKind::ValidationRejected(_) => RequestState::Rejected,
            _ => RequestState::Failed,
        }
    }

    /// True if the request was refused before anything ran
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self.terminal_state(), RequestState::Rejected)
    }
}

/// Errors that can occur in the sql-query-assistant application.
#[derive(Error, Debug)]
pub enum AssistantError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Catalog loading errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// Pipeline failures
    #[error(transparent)]
    Query(#[from] QueryError),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with AssistantError
pub type Result<T> = std::result::Result<T, AssistantError>;

impl From<anyhow::Error> for AssistantError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<sled::Error> for AssistantError {
    fn from(err: sled::Error) -> Self {
        Self::Cache(CacheError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CompletionError::Transient("503".into()).is_retryable());
        assert!(CompletionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CompletionError::Auth("401".into()).is_retryable());
        assert!(!CompletionError::Quota("402".into()).is_retryable());
        assert!(!CompletionError::InvalidResponse("no choices".into()).is_retryable());
    }

    #[test]
    fn test_query_error_reports_stage() {
        let err = QueryError {
            stage: RequestState::Validating,
            elapsed: Duration::from_millis(42),
            kind: ErrorKind::ValidationRejected(RejectReason::UnknownTable("Ghost".into())),
            sql: Some("SELECT * FROM Ghost".into()),
            trace: RequestTrace::start(),
        };
        let text = err.to_string();
        assert!(text.contains("unknown table: Ghost"));
        assert!(text.contains("stage: validating"));
        assert!(text.contains("42 ms"));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_pool_exhausted_message() {
        let err = PoolError::Exhausted {
            timeout: Duration::from_millis(100),
            last_error: Some("unable to open database file".into()),
        };
        assert!(err.to_string().contains("unable to open database file"));
    }
}
