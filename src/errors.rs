//! Crate-level error types.

use thiserror::Error;

/// Errors raised while loading configuration or talking to the database.
#[derive(Debug, Error)]
pub enum SubkeeperError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("missing credential: {0} must be set")]
    MissingCredential(&'static str),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("database API returned {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    DecodeError(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SubkeeperError {
    /// Whether this error should abort the process before any pass runs.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubkeeperError::ConfigError(_) | SubkeeperError::MissingCredential(_)
        )
    }
}

impl From<config::ConfigError> for SubkeeperError {
    fn from(err: config::ConfigError) -> Self {
        SubkeeperError::ConfigError(err.to_string())
    }
}

pub type SubkeeperResult<T> = Result<T, SubkeeperError>;
