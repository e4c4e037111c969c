use thiserror::Error;

/// Errors that can occur in the WAF node library
#[derive(Error, Debug)]
pub enum WafError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule validation error
    #[error("Rule validation error: {0}")]
    RuleValidation(String),

    /// Rule file error
    #[error("Rule file error: {0}")]
    RuleFile(String),

    /// Value extraction error
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// GeoIP lookup error
    #[error("GeoIP lookup error: {0}")]
    GeoIp(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using WafError
pub type Result<T> = std::result::Result<T, WafError>;

impl From<String> for WafError {
    fn from(s: String) -> Self {
        WafError::Other(s)
    }
}

impl From<&str> for WafError {
    fn from(s: &str) -> Self {
        WafError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for WafError {
    fn from(err: serde_json::Error) -> Self {
        WafError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for WafError {
    fn from(err: regex::Error) -> Self {
        WafError::RuleValidation(err.to_string())
    }
}
