//! Stable error taxonomy shared by every component (§7).

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// One of the reasons a compression/decompression call can fail (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFailure {
    CompressionFailed,
    DecompressionFailed,
    InvalidData,
    UnsupportedAlgorithm,
}

impl fmt::Display for CompressionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CompressionFailure::CompressionFailed => "COMPRESSION_FAILED",
            CompressionFailure::DecompressionFailed => "DECOMPRESSION_FAILED",
            CompressionFailure::InvalidData => "INVALID_DATA",
            CompressionFailure::UnsupportedAlgorithm => "UNSUPPORTED_ALGORITHM",
        };
        f.write_str(label)
    }
}

/// The stable taxonomy of §7. Variant names double as the wire `code`
/// surfaced to RPC/WebSocket clients (see [`Error::code`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("is a directory: {path}")]
    IsDirectory { path: String },

    #[error("not a directory: {path}")]
    NotDirectory { path: String },

    #[error("directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("subscription limit reached")]
    LimitReached,

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transient backend failure: {reason}")]
    Transient { reason: String },

    #[error("compression error: {kind}")]
    Compression { kind: CompressionFailure },

    #[error("invalid configuration for {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("io error during {operation} on {path:?}: {source}")]
    Io { operation: String, path: Option<String>, #[source] source: std::io::Error },
}

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Error::AlreadyExists { path: path.into() }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument { reason: reason.into() }
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Config { field: field.into(), reason: reason.into() }
    }

    pub fn io(operation: impl Into<String>, path: Option<String>, source: std::io::Error) -> Self {
        Error::Io { operation: operation.into(), path, source }
    }

    /// Stable wire-level error code (§7 "structured error objects").
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::AlreadyExists { .. } => "ALREADY_EXISTS",
            Error::IsDirectory { .. } => "IS_DIRECTORY",
            Error::NotDirectory { .. } => "NOT_DIRECTORY",
            Error::NotEmpty { .. } => "NOT_EMPTY",
            Error::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Error::LimitReached => "LIMIT_REACHED",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Transient { .. } => "TRANSIENT",
            Error::Compression { kind } => match kind {
                CompressionFailure::CompressionFailed => "COMPRESSION_FAILED",
                CompressionFailure::DecompressionFailed => "DECOMPRESSION_FAILED",
                CompressionFailure::InvalidData => "INVALID_DATA",
                CompressionFailure::UnsupportedAlgorithm => "UNSUPPORTED_ALGORITHM",
            },
            Error::Config { .. } => "CONFIG",
            Error::Io { .. } => "IO",
        }
    }

    /// Whether `transaction()` should retry on this error (§4.5, §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Error::NotFound { path }
            | Error::AlreadyExists { path }
            | Error::IsDirectory { path }
            | Error::NotDirectory { path }
            | Error::NotEmpty { path } => Some(path.as_str()),
            Error::Io { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        match &source {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
                Error::AlreadyExists { path: db.message().to_string() }
            }
            sqlx::Error::Database(db) if is_busy(db.message()) => {
                Error::Transient { reason: db.message().to_string() }
            }
            sqlx::Error::RowNotFound => Error::NotFound { path: "<row>".into() },
            other => Error::Io {
                operation: "sql".into(),
                path: None,
                source: std::io::Error::other(other.to_string()),
            },
        }
    }
}

fn is_busy(message: &str) -> bool {
    message.contains("database is locked") || message.contains("SQLITE_BUSY")
}
