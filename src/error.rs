use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("SOAP fault [{code}]: {message}")]
    OperationFault { code: String, message: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a failure, reported per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Transient,
    Authentication,
    OperationFault,
    Decode,
    Storage,
    Configuration,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Transient => "transient",
            FailureKind::Authentication => "authentication",
            FailureKind::OperationFault => "operation_fault",
            FailureKind::Decode => "decode",
            FailureKind::Storage => "storage",
            FailureKind::Configuration => "configuration",
            FailureKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

impl Error {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Transport(_) | Error::Http { .. } | Error::RetriesExhausted { .. } => {
                FailureKind::Transient
            }
            Error::Authentication(_) => FailureKind::Authentication,
            Error::OperationFault { .. } => FailureKind::OperationFault,
            Error::Decode(_) => FailureKind::Decode,
            Error::Database(_) | Error::Migration(_) | Error::Io(_) => FailureKind::Storage,
            Error::Config(_) | Error::Template(_) => FailureKind::Configuration,
            Error::Session(_) | Error::Other(_) => FailureKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Error::Template(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
