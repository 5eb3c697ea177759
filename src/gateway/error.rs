//! Error types for the inference gateway.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a gateway failure, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// The backend (or the gateway on its behalf) asked us to slow down.
    RateLimited,
    /// Network failure, timeout, 5xx, or any other transport-level problem.
    Transport,
    /// Credentials were rejected. Not the backend's fault.
    Auth,
    /// The call completed but produced no usable content.
    EmptyResponse,
}

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling the gateway.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate limited - caller should back off before the next attempt.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// API key missing, malformed or rejected.
    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Response carried no content (or only a refusal).
    #[error("empty response: {message}")]
    EmptyResponse { message: String },

    /// Invalid request - permanent error, don't retry against the same payload.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Provider error - may be retryable.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// Request timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Create a rate limited error from a provider 429.
    pub fn rate_limited(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    pub fn auth(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Auth {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::EmptyResponse {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    /// Create a provider error with context.
    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Dispatcher-facing classification.
    ///
    /// Everything that is neither a rate limit, an auth problem nor an empty
    /// body is treated as transport: another backend may well succeed.
    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            Self::RateLimited { .. } => GatewayErrorKind::RateLimited,
            Self::Auth { .. } | Self::Config(_) => GatewayErrorKind::Auth,
            Self::EmptyResponse { .. } => GatewayErrorKind::EmptyResponse,
            Self::InvalidRequest { .. }
            | Self::Provider { .. }
            | Self::Timeout(_)
            | Self::Http(_) => GatewayErrorKind::Transport,
        }
    }

    /// Whether the same call could plausibly succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::EmptyResponse { .. } => true,
            Self::Auth { .. } | Self::InvalidRequest { .. } | Self::Config(_) => false,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Auth { .. } => "auth",
            Self::EmptyResponse { .. } => "empty_response",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Auth { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            Self::EmptyResponse { .. }
            | Self::InvalidRequest { .. }
            | Self::Timeout(_)
            | Self::Http(_)
            | Self::Config(_) => None,
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_the_dispatcher_taxonomy() {
        let rl = ProviderError::rate_limited(Duration::from_secs(1), ErrorContext::new());
        assert_eq!(rl.kind(), GatewayErrorKind::RateLimited);
        assert_eq!(
            ProviderError::auth("bad key", ErrorContext::new().with_status(401)).kind(),
            GatewayErrorKind::Auth
        );
        assert_eq!(ProviderError::empty("").kind(), GatewayErrorKind::EmptyResponse);
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(3)).kind(),
            GatewayErrorKind::Transport
        );
        assert_eq!(
            ProviderError::provider("openrouter", "HTTP 502", true).kind(),
            GatewayErrorKind::Transport
        );
    }

    #[test]
    fn auth_is_never_retryable() {
        let err = ProviderError::auth("nope", ErrorContext::new());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "auth");
    }
}
