/// Errors raised while building or validating fleet configuration.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A value breaks a domain rule (robot name, tags, intervals).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An environment variable is missing or cannot be parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}
