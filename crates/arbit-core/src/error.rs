//! Error types and result aliases shared across arbit components.
//!
//! Errors are structured for programmatic handling: the API layer maps each
//! variant onto an HTTP status, the publisher and indexer decide retry
//! behavior from them.

use std::fmt;

/// The result type used throughout arbit.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in arbit core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided by a caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A primary-store operation failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the database failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The downstream queue transport rejected a message or was unreachable.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The search index returned a non-success response.
    #[error("search index error: {message}")]
    SearchIndex {
        /// Description of the search-index failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new database error with the given message.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transport error with the given message.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new search-index error with the given message.
    #[must_use]
    pub fn search_index(message: impl Into<String>) -> Self {
        Self::SearchIndex {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::Database {
            message: value.to_string(),
            source: Some(Box::new(value)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            message: value.to_string(),
        }
    }
}
