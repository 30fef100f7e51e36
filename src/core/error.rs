use super::category::{ErrorCategory, ErrorReport};
use crate::retry::categorize::categorize_message;
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("HTTP {status}: {message}")]
    Http { status: StatusCode, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Business rule violated: {0}")]
    Business(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage quota exceeded while writing '{key}' ({required} bytes, limit {limit})")]
    QuotaExceeded {
        key: String,
        required: usize,
        limit: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Background worker error: {0}")]
    Worker(String),

    #[error("Queued operation '{0}' not found")]
    OperationNotFound(String),

    #[error("Gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        queued_operation_id: Option<String>,
        #[source]
        source: Box<ResilienceError>,
    },

    /// Untyped failure from an uncontrolled source; categorized heuristically.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ResilienceError>;

impl ResilienceError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Explicit category of this error. Only `Other` consults the message heuristic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResilienceError::Network(_) => ErrorCategory::Network,
            ResilienceError::Timeout(_) => ErrorCategory::Timeout,
            ResilienceError::RateLimited { .. } => ErrorCategory::RateLimit,
            ResilienceError::Http { status, .. } => category_for_status(*status),
            ResilienceError::Authentication(_) => ErrorCategory::Authentication,
            ResilienceError::Authorization(_) => ErrorCategory::Authorization,
            ResilienceError::Validation(_) => ErrorCategory::Validation,
            ResilienceError::NotFound(_) | ResilienceError::OperationNotFound(_) => {
                ErrorCategory::NotFound
            }
            ResilienceError::Conflict(_) => ErrorCategory::Conflict,
            ResilienceError::Parse(_) | ResilienceError::Serialization(_) => ErrorCategory::Parse,
            ResilienceError::Business(_) => ErrorCategory::Business,
            ResilienceError::Storage(_)
            | ResilienceError::QuotaExceeded { .. }
            | ResilienceError::LockError(_)
            | ResilienceError::Worker(_) => ErrorCategory::Unknown,
            ResilienceError::Exhausted { source, .. } => source.category(),
            ResilienceError::Other(message) => categorize_message(message),
        }
    }

    /// Variant name, recorded as the `name` of the mode controller's last error.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResilienceError::Network(_) => "NetworkError",
            ResilienceError::Timeout(_) => "TimeoutError",
            ResilienceError::RateLimited { .. } => "RateLimitError",
            ResilienceError::Http { .. } => "HttpError",
            ResilienceError::Authentication(_) => "AuthenticationError",
            ResilienceError::Authorization(_) => "AuthorizationError",
            ResilienceError::Validation(_) => "ValidationError",
            ResilienceError::NotFound(_) => "NotFoundError",
            ResilienceError::Conflict(_) => "ConflictError",
            ResilienceError::Parse(_) => "ParseError",
            ResilienceError::Business(_) => "BusinessError",
            ResilienceError::Storage(_) => "StorageError",
            ResilienceError::QuotaExceeded { .. } => "QuotaExceededError",
            ResilienceError::Serialization(_) => "SerializationError",
            ResilienceError::LockError(_) => "LockError",
            ResilienceError::Worker(_) => "WorkerError",
            ResilienceError::OperationNotFound(_) => "OperationNotFoundError",
            ResilienceError::Exhausted { source, .. } => source.kind_name(),
            ResilienceError::Other(_) => "Error",
        }
    }

    pub fn queued_operation_id(&self) -> Option<&str> {
        match self {
            ResilienceError::Exhausted {
                queued_operation_id,
                ..
            } => queued_operation_id.as_deref(),
            _ => None,
        }
    }

    pub fn report(&self) -> ErrorReport {
        let category = self.category();
        ErrorReport {
            category,
            title: category.title().to_string(),
            message: self.to_string(),
            suggestions: category
                .recovery_suggestions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            queued_operation_id: self.queued_operation_id().map(str::to_string),
        }
    }
}

/// Maps an HTTP status returned by the proxied API to a failure category.
pub fn category_for_status(status: StatusCode) -> ErrorCategory {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCategory::Validation,
        StatusCode::UNAUTHORIZED => ErrorCategory::Authentication,
        StatusCode::FORBIDDEN => ErrorCategory::Authorization,
        StatusCode::NOT_FOUND | StatusCode::GONE => ErrorCategory::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorCategory::Timeout,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ErrorCategory::Conflict,
        StatusCode::TOO_MANY_REQUESTS => ErrorCategory::RateLimit,
        s if s.is_server_error() => ErrorCategory::Server,
        _ => ErrorCategory::Unknown,
    }
}

impl<T> From<std::sync::PoisonError<T>> for ResilienceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable => Self::Network(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ResilienceError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        let cases = [
            (StatusCode::BAD_REQUEST, ErrorCategory::Validation),
            (StatusCode::UNAUTHORIZED, ErrorCategory::Authentication),
            (StatusCode::FORBIDDEN, ErrorCategory::Authorization),
            (StatusCode::NOT_FOUND, ErrorCategory::NotFound),
            (StatusCode::CONFLICT, ErrorCategory::Conflict),
            (StatusCode::TOO_MANY_REQUESTS, ErrorCategory::RateLimit),
            (StatusCode::BAD_GATEWAY, ErrorCategory::Server),
            (StatusCode::GATEWAY_TIMEOUT, ErrorCategory::Timeout),
            (StatusCode::IM_A_TEAPOT, ErrorCategory::Unknown),
        ];
        for (status, expected) in cases {
            assert_eq!(ResilienceError::http(status, "x").category(), expected);
        }
    }

    #[test]
    fn test_exhausted_keeps_source_category() {
        let err = ResilienceError::Exhausted {
            attempts: 3,
            queued_operation_id: Some("op-1".into()),
            source: Box::new(ResilienceError::Network("offline".into())),
        };
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.kind_name(), "NetworkError");

        let report = err.report();
        assert_eq!(report.queued_operation_id.as_deref(), Some("op-1"));
        assert_eq!(report.title, "Connection problem");
        assert!(!report.suggestions.is_empty());
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout: ResilienceError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(timeout.category(), ErrorCategory::Timeout);

        let refused: ResilienceError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down").into();
        assert_eq!(refused.category(), ErrorCategory::Network);

        let disk: ResilienceError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro").into();
        assert!(matches!(disk, ResilienceError::Storage(_)));
    }

    #[test]
    fn test_untyped_errors_use_message_heuristic() {
        assert_eq!(
            ResilienceError::other("Request failed with status 503").category(),
            ErrorCategory::Server
        );
        assert_eq!(
            ResilienceError::other("something odd").category(),
            ErrorCategory::Unknown
        );
    }
}
