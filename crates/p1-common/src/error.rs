//! Error types shared across the P1 workspace

use thiserror::Error;

/// Result type alias for shared P1 operations
pub type Result<T> = std::result::Result<T, P1Error>;

/// Errors that are not specific to a single pipeline component
#[derive(Error, Debug)]
pub enum P1Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl P1Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = P1Error::config("db_dsn must not be empty");
        assert_eq!(err.to_string(), "Configuration error: db_dsn must not be empty");
    }
}
