//! Heimdall error types

use std::fmt;
use std::time::Duration;

/// Heimdall error types
#[derive(Debug, thiserror::Error)]
pub enum HeimdallError {
    // Transient provider/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    // Permanent provider errors
    #[error("authentication failed ({status}): {message}")]
    AuthenticationFailed { status: u16, message: String },

    #[error("access forbidden ({status}): {message}")]
    Forbidden { status: u16, message: String },

    #[error("endpoint not found: {endpoint}")]
    NotFound { endpoint: String },

    // Governance errors
    #[error("monthly quota exhausted: {usage} requests used, block threshold is {block_threshold}")]
    QuotaExceeded { usage: u64, block_threshold: u64 },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<HeimdallError>,
    },

    // Local storage errors
    /// Absorbed by the cache store and reported as a miss; exposed so
    /// backends can classify what they log.
    #[error("corrupt cache entry {key}: {reason}")]
    CacheCorrupted { key: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Stable, enumerable error categories callers can branch on without
/// knowing the provider's wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CacheReadCorruption,
    QuotaExceeded,
    TransientProviderError,
    RetryExhausted,
    PermanentProviderError,
    Storage,
    InvalidInput,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheReadCorruption => "cache_read_corruption",
            Self::QuotaExceeded => "quota_exceeded",
            Self::TransientProviderError => "transient_provider_error",
            Self::RetryExhausted => "retry_exhausted",
            Self::PermanentProviderError => "permanent_provider_error",
            Self::Storage => "storage",
            Self::InvalidInput => "invalid_input",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HeimdallError {
    /// Whether the error is worth retrying against the provider.
    ///
    /// Timeouts, connection failures, 429 and 5xx responses are transient.
    /// Everything else, including local errors, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the provider rejected the request in a way retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::AuthenticationFailed { .. } | Self::Forbidden { .. } | Self::NotFound { .. } => {
                true
            }
            Self::Api { status, .. } => (400..500).contains(status) && *status != 429,
            _ => false,
        }
    }

    /// Provider-supplied backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// The stable category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CacheCorrupted { .. } => ErrorKind::CacheReadCorruption,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Json(_) | Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Configuration(_) => ErrorKind::Configuration,
            e if e.is_transient() => ErrorKind::TransientProviderError,
            _ => ErrorKind::PermanentProviderError,
        }
    }

    /// HTTP status reported by the provider, when the error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. }
            | Self::AuthenticationFailed { status, .. }
            | Self::Forbidden { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            Self::RateLimited { .. } => Some(429),
            Self::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HeimdallError {
    fn from(err: std::io::Error) -> Self {
        HeimdallError::Storage(err.to_string())
    }
}

/// Result type alias for Heimdall operations
pub type Result<T> = std::result::Result<T, HeimdallError>;
