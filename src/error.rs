// for error definitions
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification carried by errors that wrapped operations return.
///
/// The retry handler decides whether to try again purely from this code, so the
/// mapping from code to verdict must stay free of side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorCode {
    Timeout,
    Unavailable,
    RateLimited,
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    Internal,
    Conflict,
    BadRequest,
}

impl ServiceErrorCode {
    /// Codes retried when a policy does not list its own
    pub const RETRYABLE_BY_DEFAULT: [ServiceErrorCode; 3] = [
        ServiceErrorCode::Timeout,
        ServiceErrorCode::Unavailable,
        ServiceErrorCode::RateLimited,
    ];

    /// Default retry verdict for this code
    pub fn is_retryable(self) -> bool {
        Self::RETRYABLE_BY_DEFAULT.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceErrorCode::Timeout => "timeout",
            ServiceErrorCode::Unavailable => "unavailable",
            ServiceErrorCode::RateLimited => "rate_limited",
            ServiceErrorCode::Validation => "validation",
            ServiceErrorCode::NotFound => "not_found",
            ServiceErrorCode::Unauthorized => "unauthorized",
            ServiceErrorCode::Forbidden => "forbidden",
            ServiceErrorCode::Internal => "internal",
            ServiceErrorCode::Conflict => "conflict",
            ServiceErrorCode::BadRequest => "bad_request",
        }
    }
}

impl ServiceErrorCode {
    pub fn status(self) -> StatusMapping {
        lookup_status(ErrorKind::Service, Some(self))
    }
}

impl fmt::Display for ServiceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by a protected downstream call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ServiceErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ServiceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// The circuit breaker rejected the call without running it
    #[error("circuit breaker '{service}' is open, resets in {reset_after:?}")]
    CircuitOpen {
        service: String,
        reset_after: Duration,
    },

    /// Admission was denied by a rate limiter
    #[error("rate limit exceeded for '{key}' ({remaining}/{limit}), retry after {retry_after:?}")]
    RateLimitExceeded {
        key: String,
        limit: u64,
        remaining: u64,
        retry_after: Duration,
    },

    /// The deadline fired before the operation finished
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Both the semaphore and the wait queue were full, or the queue wait expired
    #[error("bulkhead '{partition}' is full (max: {max_concurrent}, queue: {max_queue})")]
    BulkheadFull {
        partition: String,
        max_concurrent: usize,
        max_queue: usize,
    },

    /// Every attempt failed with a retryable error
    #[error("all {attempts} retry attempts exhausted for '{service}'")]
    RetryExhausted {
        service: String,
        attempts: u32,
        #[source]
        source: Box<ResilienceError>,
    },

    /// Policy validation failure
    #[error("invalid policy '{policy}': field '{field}' {reason}")]
    InvalidPolicy {
        policy: String,
        field: String,
        reason: String,
    },

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled by caller")]
    Cancelled,

    /// The wrapped operation's own error, passed through untouched
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Unexpected or internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Discriminant of [`ResilienceError`] used for protocol mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    RateLimitExceeded,
    Timeout,
    BulkheadFull,
    RetryExhausted,
    InvalidPolicy,
    NotFound,
    Cancelled,
    Service,
    Internal,
}

/// Transport status an error kind maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMapping {
    pub http: u16,
    pub grpc: &'static str,
}

const fn status(http: u16, grpc: &'static str) -> StatusMapping {
    StatusMapping { http, grpc }
}

/// Single lookup table from error to transport status. Engine errors are keyed
/// by kind alone; errors from the wrapped operation by their service code.
pub const STATUS_TABLE: [(ErrorKind, Option<ServiceErrorCode>, StatusMapping); 19] = [
    (ErrorKind::CircuitOpen, None, status(503, "UNAVAILABLE")),
    (ErrorKind::RateLimitExceeded, None, status(429, "RESOURCE_EXHAUSTED")),
    (ErrorKind::Timeout, None, status(504, "DEADLINE_EXCEEDED")),
    (ErrorKind::BulkheadFull, None, status(429, "RESOURCE_EXHAUSTED")),
    (ErrorKind::RetryExhausted, None, status(503, "UNAVAILABLE")),
    (ErrorKind::InvalidPolicy, None, status(400, "INVALID_ARGUMENT")),
    (ErrorKind::NotFound, None, status(404, "NOT_FOUND")),
    (ErrorKind::Cancelled, None, status(499, "CANCELLED")),
    (ErrorKind::Internal, None, status(500, "INTERNAL")),
    (ErrorKind::Service, Some(ServiceErrorCode::Timeout), status(504, "DEADLINE_EXCEEDED")),
    (ErrorKind::Service, Some(ServiceErrorCode::Unavailable), status(503, "UNAVAILABLE")),
    (ErrorKind::Service, Some(ServiceErrorCode::RateLimited), status(429, "RESOURCE_EXHAUSTED")),
    (ErrorKind::Service, Some(ServiceErrorCode::Validation), status(400, "INVALID_ARGUMENT")),
    (ErrorKind::Service, Some(ServiceErrorCode::NotFound), status(404, "NOT_FOUND")),
    (ErrorKind::Service, Some(ServiceErrorCode::Unauthorized), status(401, "UNAUTHENTICATED")),
    (ErrorKind::Service, Some(ServiceErrorCode::Forbidden), status(403, "PERMISSION_DENIED")),
    (ErrorKind::Service, Some(ServiceErrorCode::Internal), status(500, "INTERNAL")),
    (ErrorKind::Service, Some(ServiceErrorCode::Conflict), status(409, "ALREADY_EXISTS")),
    (ErrorKind::Service, Some(ServiceErrorCode::BadRequest), status(400, "INVALID_ARGUMENT")),
];

const UNMAPPED: StatusMapping = status(500, "INTERNAL");

fn lookup_status(kind: ErrorKind, code: Option<ServiceErrorCode>) -> StatusMapping {
    STATUS_TABLE
        .iter()
        .find(|(k, c, _)| *k == kind && *c == code)
        .map(|(_, _, mapping)| *mapping)
        .unwrap_or(UNMAPPED)
}

impl ErrorKind {
    /// Status for engine errors. [`ErrorKind::Service`] needs its code, so on its
    /// own it maps to 500.
    pub fn status(self) -> StatusMapping {
        lookup_status(self, None)
    }
}

impl ResilienceError {
    /// Shorthand for building a validation failure
    pub fn invalid_policy(
        policy: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ResilienceError::InvalidPolicy {
            policy: policy.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ResilienceError::Timeout { .. } => ErrorKind::Timeout,
            ResilienceError::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            ResilienceError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            ResilienceError::InvalidPolicy { .. } => ErrorKind::InvalidPolicy,
            ResilienceError::PolicyNotFound(_) => ErrorKind::NotFound,
            ResilienceError::Cancelled => ErrorKind::Cancelled,
            ResilienceError::Service(_) => ErrorKind::Service,
            ResilienceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transport status for this error
    pub fn status(&self) -> StatusMapping {
        match self {
            ResilienceError::Service(err) => lookup_status(ErrorKind::Service, Some(err.code)),
            _ => lookup_status(self.kind(), None),
        }
    }

    /// Retry classification of this error.
    ///
    /// `None` means the error is an engine rejection that must never be retried
    /// (open circuit, full bulkhead, exhausted retries, invalid policy, cancellation).
    pub fn classification(&self) -> Option<ServiceErrorCode> {
        match self {
            ResilienceError::Service(err) => Some(err.code),
            ResilienceError::Timeout { .. } => Some(ServiceErrorCode::Timeout),
            ResilienceError::RateLimitExceeded { .. } => Some(ServiceErrorCode::RateLimited),
            ResilienceError::Internal(_) => Some(ServiceErrorCode::Internal),
            _ => None,
        }
    }

    /// Retry verdict under the default retryable set
    pub fn is_retryable(&self) -> bool {
        self.classification()
            .map(ServiceErrorCode::is_retryable)
            .unwrap_or(false)
    }
}

// implement conversions from serde_json::Error to ResilienceError
impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        ResilienceError::Internal(format!("serialization: {}", err))
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification_is_fixed() {
        let retryable = [
            ServiceErrorCode::Timeout,
            ServiceErrorCode::Unavailable,
            ServiceErrorCode::RateLimited,
        ];
        let permanent = [
            ServiceErrorCode::Validation,
            ServiceErrorCode::NotFound,
            ServiceErrorCode::Unauthorized,
            ServiceErrorCode::Forbidden,
            ServiceErrorCode::Internal,
            ServiceErrorCode::Conflict,
            ServiceErrorCode::BadRequest,
        ];

        for code in retryable {
            for _ in 0..3 {
                assert!(code.is_retryable(), "{} should be retryable", code);
            }
        }
        for code in permanent {
            assert!(!code.is_retryable(), "{} should not be retryable", code);
        }
    }

    #[test]
    fn test_engine_rejections_are_not_retryable() {
        let open = ResilienceError::CircuitOpen {
            service: "payments".to_string(),
            reset_after: Duration::from_secs(1),
        };
        let full = ResilienceError::BulkheadFull {
            partition: "db".to_string(),
            max_concurrent: 1,
            max_queue: 0,
        };

        assert_eq!(open.classification(), None);
        assert!(!open.is_retryable());
        assert!(!full.is_retryable());
        assert!(!ResilienceError::Cancelled.is_retryable());

        let timeout = ResilienceError::Timeout {
            operation: "fetch".to_string(),
            timeout: Duration::from_millis(5),
        };
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_status_table_mapping() {
        let cases = [
            (ErrorKind::CircuitOpen, 503, "UNAVAILABLE"),
            (ErrorKind::RateLimitExceeded, 429, "RESOURCE_EXHAUSTED"),
            (ErrorKind::Timeout, 504, "DEADLINE_EXCEEDED"),
            (ErrorKind::InvalidPolicy, 400, "INVALID_ARGUMENT"),
            (ErrorKind::BulkheadFull, 429, "RESOURCE_EXHAUSTED"),
        ];

        for (kind, http, grpc) in cases {
            let mapping = kind.status();
            assert_eq!(mapping.http, http, "http status for {:?}", kind);
            assert_eq!(mapping.grpc, grpc, "grpc code for {:?}", kind);
        }
    }

    #[test]
    fn test_status_table_has_one_row_per_error() {
        let kinds = [
            ErrorKind::CircuitOpen,
            ErrorKind::RateLimitExceeded,
            ErrorKind::Timeout,
            ErrorKind::BulkheadFull,
            ErrorKind::RetryExhausted,
            ErrorKind::InvalidPolicy,
            ErrorKind::NotFound,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ];
        let codes = [
            ServiceErrorCode::Timeout,
            ServiceErrorCode::Unavailable,
            ServiceErrorCode::RateLimited,
            ServiceErrorCode::Validation,
            ServiceErrorCode::NotFound,
            ServiceErrorCode::Unauthorized,
            ServiceErrorCode::Forbidden,
            ServiceErrorCode::Internal,
            ServiceErrorCode::Conflict,
            ServiceErrorCode::BadRequest,
        ];

        let rows = |kind: ErrorKind, code: Option<ServiceErrorCode>| {
            STATUS_TABLE.iter().filter(|(k, c, _)| *k == kind && *c == code).count()
        };
        for kind in kinds {
            assert_eq!(rows(kind, None), 1, "{:?}", kind);
        }
        for code in codes {
            assert_eq!(rows(ErrorKind::Service, Some(code)), 1, "{}", code);
            assert_eq!(code.status(), ResilienceError::from(ServiceError::new(code, "x")).status());
        }
        assert_eq!(STATUS_TABLE.len(), kinds.len() + codes.len());
        assert_eq!(ServiceErrorCode::Conflict.status().grpc, "ALREADY_EXISTS");
    }

    #[test]
    fn test_service_error_passes_code_through() {
        let err: ResilienceError =
            ServiceError::new(ServiceErrorCode::Forbidden, "no access").into();

        assert_eq!(err.classification(), Some(ServiceErrorCode::Forbidden));
        assert_eq!(err.status().http, 403);
        assert_eq!(err.to_string(), "forbidden: no access");
    }

    #[test]
    fn test_invalid_policy_message_names_field() {
        let err = ResilienceError::invalid_policy("checkout", "retry.max_attempts", "must be >= 1");
        assert_eq!(
            err.to_string(),
            "invalid policy 'checkout': field 'retry.max_attempts' must be >= 1"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    }
}
