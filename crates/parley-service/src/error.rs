use parley_core::errors::ProviderError;
use parley_store::StoreError;

/// Error taxonomy surfaced to transports. Each variant maps onto the
/// HTTP-style class the wire protocol reports.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream provider error: {0}")]
    Upstream(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl ServiceError {
    /// Stable machine-readable code for acks and socketError events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Upstream(_) => "UPSTREAM",
            Self::Store(_) => "INTERNAL",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: ServiceError = StoreError::NotFound("conversation conv_1".into()).into();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn other_store_errors_stay_internal() {
        let err: ServiceError = StoreError::Serialization("bad json".into()).into();
        assert!(matches!(err, ServiceError::Store(_)));
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn provider_errors_map_to_upstream() {
        let err: ServiceError = ProviderError::Overloaded.into();
        assert_eq!(err.code(), "UPSTREAM");
    }
}
