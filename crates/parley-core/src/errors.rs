use std::time::Duration;

/// Typed error hierarchy for chat-provider calls.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Overloaded | Self::NetworkError(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::UnknownModel(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownModel(_) => "unknown_model",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 => Self::InvalidRequest(body),
            404 => Self::UnknownModel(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ProviderError::Overloaded.is_retryable());
        assert!(ProviderError::NetworkError("tcp".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(ProviderError::InvalidRequest("bad".into()).is_fatal());
        assert!(ProviderError::UnknownModel("gpt-99".into()).is_fatal());
    }

    #[test]
    fn timeout_neither_fatal_nor_retryable() {
        let timeout = ProviderError::Timeout(Duration::from_secs(120));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(ProviderError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(ProviderError::from_status(400, "bad request".into()).is_fatal());
        assert!(ProviderError::from_status(429, "slow down".into()).is_retryable());
        assert!(ProviderError::from_status(529, "overloaded".into()).is_retryable());
        assert!(ProviderError::from_status(502, "bad gateway".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Overloaded.error_kind(), "overloaded");
        assert_eq!(
            ProviderError::MalformedResponse("no content".into()).error_kind(),
            "malformed_response"
        );
    }
}
