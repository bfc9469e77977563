//! Error type definitions for the relay server
//!
//! Failures internal to the fan-out engine (dropped chunks, restarts,
//! backoff) are logged where they happen and never surfaced to subscribers;
//! only admission-time and attach-time errors become HTTP responses.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Filesystem and pipe errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Streaming engine errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors surfaced by the streaming engine at attach time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The session's upstream repeatedly failed and the session rejects
    /// new subscribers until it is destroyed and recreated.
    #[error("channel is offline or unavailable")]
    Blacklisted,

    /// The session has been stopped and is awaiting removal.
    #[error("session has been stopped")]
    Stopped,

    /// The media child process could not be started.
    #[error("failed to start media process: {0}")]
    Spawn(String),
}
