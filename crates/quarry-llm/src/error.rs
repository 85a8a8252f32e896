use std::time::Duration;

use crate::retry::Retryable;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{provider} returned status {status}")]
    Status { provider: String, status: u16 },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("expected {expected} embeddings, got {got}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{0}")]
    Other(String),
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500,
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Json(_)
            | Self::EmptyResponse { .. }
            | Self::BatchMismatch { .. }
            | Self::Other(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_owned(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = LlmError::Status {
            provider: "openai".into(),
            status: 503,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = LlmError::Status {
            provider: "openai".into(),
            status: 400,
        };
        assert!(!err.is_retryable());
        assert!(!LlmError::Other("bad".into()).is_retryable());
    }

    #[test]
    fn rate_limit_carries_hint() {
        let err = LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn timeout_display() {
        let err = LlmError::timed_out("embed", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "embed timed out after 1.5s");
    }
}
