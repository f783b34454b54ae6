use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Errors are stored on cache entries and handed to every subscriber, so the
/// type is `Clone` and carries rendered messages rather than source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A required parameter is missing; the query stays gated.
    #[error("Query not ready: {0}")]
    NotReady(String),

    /// The caller disabled the query.
    #[error("Query disabled")]
    Disabled,

    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Retries exhausted, or the failure was not retryable.
    #[error("Fetch failed after {attempts} attempt(s): {message}")]
    Terminal { attempts: u32, message: String },

    /// The key is already cached with a value of another type.
    #[error("Cache entry {key} holds a different value type")]
    TypeMismatch { key: String },
}

impl QueryError {
    /// Returns `true` if a retry could plausibly succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::FetchError(_) | Self::NetworkError(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns `true` for the gating variants, which are not failures.
    pub const fn is_gated(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::FetchError("test error".to_string());
        assert_eq!(err.to_string(), "Fetch failed: test error");

        let err = QueryError::Terminal {
            attempts: 4,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Fetch failed after 4 attempt(s): boom");
    }

    #[test]
    fn test_transient_classification() {
        assert!(QueryError::NetworkError("reset".into()).is_transient());
        assert!(
            QueryError::Http {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !QueryError::Http {
                status: 404,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!QueryError::Decode("bad".into()).is_transient());
        assert!(!QueryError::Disabled.is_transient());
        assert!(QueryError::NotReady("id".into()).is_gated());
    }
}
