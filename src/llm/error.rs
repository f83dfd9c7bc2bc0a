//! Error types for chat completion backends.
//!
//! Each variant carries a stable SCREAMING_SNAKE_CASE code, included in the
//! Display output as `[CODE] message` and available via [`LlmError::code()`].

/// Stable error codes.
pub mod error_codes {
    /// Invalid or missing backend configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Authentication failed (invalid or missing API key).
    pub const AUTH_FAILED: &str = "AUTH_FAILED";

    /// The request could not be sent or was rejected transiently.
    pub const REQUEST_FAILED: &str = "REQUEST_FAILED";

    /// The response stream broke or carried an error.
    pub const STREAM_FAILED: &str = "STREAM_FAILED";

    /// Connect or read timeout.
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";

    /// Any other non-success reply from the provider.
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
}

/// Errors produced by a [`ChatBackend`](super::backend::ChatBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    ConfigError(String),

    #[error("[{}] {}", error_codes::AUTH_FAILED, .0)]
    AuthError(String),

    #[error("[{}] {}", error_codes::REQUEST_FAILED, .0)]
    RequestError(String),

    #[error("[{}] {}", error_codes::STREAM_FAILED, .0)]
    StreamError(String),

    #[error("[{}] {}", error_codes::TIMEOUT_ERROR, .0)]
    TimeoutError(String),

    /// Non-success status that is neither auth nor rate limiting. Usually 5xx.
    #[error("[{}] {}", error_codes::PROVIDER_ERROR, .0)]
    ProviderError(String),
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => error_codes::CONFIG_INVALID,
            Self::AuthError(_) => error_codes::AUTH_FAILED,
            Self::RequestError(_) => error_codes::REQUEST_FAILED,
            Self::StreamError(_) => error_codes::STREAM_FAILED,
            Self::TimeoutError(_) => error_codes::TIMEOUT_ERROR,
            Self::ProviderError(_) => error_codes::PROVIDER_ERROR,
        }
    }

    /// The message without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::ConfigError(m)
            | Self::AuthError(m)
            | Self::RequestError(m)
            | Self::StreamError(m)
            | Self::TimeoutError(m)
            | Self::ProviderError(m) => m,
        }
    }

    /// Network, timeout, rate-limit and server failures are worth one more
    /// attempt. Configuration and credential problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConfigError(_) | Self::AuthError(_) => false,
            Self::RequestError(_)
            | Self::StreamError(_)
            | Self::TimeoutError(_)
            | Self::ProviderError(_) => true,
        }
    }
}
