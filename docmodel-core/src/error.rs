//! Error types and result types for model operations.
//!
//! Every fallible operation in this crate returns [`ModelResult<T>`]. Fatal errors
//! abort the current call chain; population and watch failures are reported through
//! `tracing` instead and never surface here.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors raised while building or executing a model pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Missing or invalid connection string, unknown alias, or an invalid argument
    /// passed while connecting.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A document violated a field constraint of its schema.
    /// Only the first violation encountered is reported.
    #[error("Validation error: field `{field}` {message}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// What went wrong.
        message: String,
    },
    /// The pipeline could not be built or the store rejected the command.
    #[error("Query error: {0}")]
    Query(String),
    /// Serialization/deserialization error when converting between documents and BSON.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A read executed in `or_fail` mode produced no rows.
    #[error("{0}")]
    NotFound(String),
    /// A populate step could not be resolved.
    #[error("Population error: {0}")]
    Population(String),
    /// A change stream could not be opened or decoded.
    #[error("Watch error: {0}")]
    Watch(String),
    /// Session or transaction failure.
    #[error("Session error: {0}")]
    Session(String),
    /// Invalid cron expression or scheduler failure.
    #[error("Schedule error: {0}")]
    Schedule(String),
    /// A bounded operation did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ModelError {
    /// Shorthand for building a [`ModelError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ModelError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A specialized `Result` type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

impl From<BsonError> for ModelError {
    fn from(err: BsonError) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for ModelError {
    fn from(err: SerdeJsonError) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Configuration(err.to_string())
    }
}
