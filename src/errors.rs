use thiserror::Error;

/// Typed error hierarchy for nanobot.
///
/// Use at module boundaries (channel sends, cron mutations, config loading).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum NanobotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error("Cron error: {0}")]
    Cron(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using NanobotError.
pub type NanobotResult<T> = std::result::Result<T, NanobotError>;
