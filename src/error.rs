use miette::Diagnostic;
use thiserror::Error;

/// Main error type for the application
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Failed to fetch calendar: {message}")]
    #[diagnostic(code(calfeed::fetch))]
    Fetch {
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to parse calendar: {0}")]
    #[diagnostic(code(calfeed::parse))]
    Parse(String),

    #[error("Calendar source not found: {0}")]
    #[diagnostic(
        code(calfeed::source_not_found),
        help("check the configured source names")
    )]
    SourceNotFound(String),

    #[error("Cache error: {0}")]
    #[diagnostic(code(calfeed::cache))]
    Cache(String),

    #[error("Query cancelled")]
    #[diagnostic(code(calfeed::cancelled))]
    Cancelled,

    #[error("Environment error: {0}")]
    #[diagnostic(code(calfeed::environment))]
    Environment(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(calfeed::config))]
    Config(String),

    #[error(transparent)]
    #[diagnostic(code(calfeed::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(calfeed::serialization))]
    Serialization(String),

    #[error("Other error: {0}")]
    #[diagnostic(code(calfeed::other))]
    Other(String),
}

// Implement From for TOML deserialization errors
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

// Implement From for JSON errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Type alias for Result with our Error type
pub type FeedResult<T> = Result<T, Error>;

/// Helper to create environment errors
pub fn env_error(var: &str) -> Error {
    Error::Environment(format!("Invalid environment variable: {}", var))
}

/// Helper to create configuration errors
pub fn config_error(message: &str) -> Error {
    Error::Config(message.to_string())
}

/// Helper to create fetch errors that carry an HTTP status
pub fn fetch_error(status: Option<u16>, message: &str) -> Error {
    Error::Fetch {
        status,
        message: message.to_string(),
    }
}

/// Helper to create parse errors
pub fn parse_error(message: &str) -> Error {
    Error::Parse(message.to_string())
}

/// Helper to create cache errors
pub fn cache_error(message: &str) -> Error {
    Error::Cache(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_message_carries_status_text() {
        let err = fetch_error(Some(404), "HTTP 404 Not Found");
        assert_eq!(err.to_string(), "Failed to fetch calendar: HTTP 404 Not Found");
        match err {
            Error::Fetch { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_source_not_found_message() {
        let err = Error::SourceNotFound("work".to_string());
        assert_eq!(err.to_string(), "Calendar source not found: work");
    }
}
