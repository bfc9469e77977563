//! Error types for the relay server.

pub mod types;

pub use types::{AppError, StreamError};
