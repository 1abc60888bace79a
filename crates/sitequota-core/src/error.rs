//! Unified error handling for sitequota-core
//!
//! Only setup (opening the database, resolving its path) can fail with this
//! type. Quota operations never fail; store problems surface as a
//! [`crate::services::quota::Notice`] on the resolution instead.

use thiserror::Error;

/// Core error type for sitequota-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for sitequota-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
