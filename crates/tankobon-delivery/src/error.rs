//! Error types for chapter delivery.
//!
//! Every failure a job can hit is named here, together with the retry and
//! reporting decisions that follow from it. Only `RateLimited` is retried;
//! it is absorbed by the retry policy and never reaches the job boundary.

use std::{fmt, time::Duration};

use tankobon_core::{CoreError, OutputFormat, RecipientId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while producing or delivering a job.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The source yielded no usable content for the item.
    #[error("content unavailable for {content_ref}: {reason}")]
    ContentUnavailable {
        /// Item that could not be fetched
        content_ref: String,
        /// What went wrong
        reason: String,
    },

    /// One output format could not be built.
    #[error("failed to build {format}: {message}")]
    ConversionFailed {
        /// Format that failed
        format: OutputFormat,
        /// Converter error message
        message: String,
    },

    /// Outbound channel asked us to back off.
    #[error("rate limited: retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        /// Wait declared by the channel
        retry_after: Duration,
    },

    /// The recipient has severed the channel.
    #[error("recipient {recipient} blocked the channel")]
    RecipientBlocked {
        /// Recipient that blocked us
        recipient: RecipientId,
    },

    /// Outbound channel rejected the request.
    #[error("channel error{}: {message}", status_suffix(.status_code))]
    ChannelError {
        /// HTTP status, when the channel is HTTP based
        status_code: Option<u16>,
        /// Response body or client error
        message: String,
    },

    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// An operation exceeded its time budget.
    #[error("timed out after {}s", .timeout.as_secs())]
    Timeout {
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// A persistent store call failed.
    #[error("store error: {message}")]
    StoreError {
        /// Store error message
        message: String,
    },

    /// Queue bookkeeping was found in an impossible state.
    #[error("scheduler invariant violated: {message}")]
    InvariantViolation {
        /// What was observed
        message: String,
    },

    /// Rate-limit waits exceeded the configured total budget.
    #[error("gave up after {attempts} attempts and {}s of waiting", .waited.as_secs())]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Total time spent sleeping
        waited: Duration,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {}s", .timeout.as_secs())]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker that panicked
        worker_id: usize,
        /// Panic payload or join error
        error: String,
    },
}

impl DeliveryError {
    /// Creates a content-unavailable error.
    pub fn content_unavailable(content_ref: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::ContentUnavailable { content_ref: content_ref.to_string(), reason: reason.into() }
    }

    /// Creates a conversion error for one format.
    pub fn conversion(format: OutputFormat, message: impl Into<String>) -> Self {
        Self::ConversionFailed { format, message: message.into() }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates a recipient-blocked error.
    pub fn blocked(recipient: RecipientId) -> Self {
        Self::RecipientBlocked { recipient }
    }

    /// Creates a channel error.
    pub fn channel(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::ChannelError { status_code, message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError { message: message.into() }
    }

    /// Creates an invariant violation.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether the retry policy should try the same call again.
    ///
    /// Only channel backpressure qualifies. Everything else either cannot
    /// succeed on retry or risks double delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Wait requested by the channel, for rate limits.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether this error means the recipient should receive nothing more.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::RecipientBlocked { .. })
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|code| format!(" (HTTP {code})")).unwrap_or_default()
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::store(err.to_string())
    }
}

/// Category of delivery error for logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing source content.
    Content,
    /// Format conversion.
    Conversion,
    /// Channel backpressure.
    RateLimit,
    /// Recipient blocked the channel.
    Blocked,
    /// Channel or network failure.
    Channel,
    /// Time budget exceeded.
    Timeout,
    /// Persistent store.
    Store,
    /// Queue bookkeeping.
    Scheduler,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle.
    Lifecycle,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::ContentUnavailable { .. } => Self::Content,
            DeliveryError::ConversionFailed { .. } => Self::Conversion,
            DeliveryError::RateLimited { .. } | DeliveryError::RetriesExhausted { .. } => {
                Self::RateLimit
            },
            DeliveryError::RecipientBlocked { .. } => Self::Blocked,
            DeliveryError::ChannelError { .. } | DeliveryError::NetworkError { .. } => {
                Self::Channel
            },
            DeliveryError::Timeout { .. } => Self::Timeout,
            DeliveryError::StoreError { .. } => Self::Store,
            DeliveryError::InvariantViolation { .. } => Self::Scheduler,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::WorkerPanic { .. } => {
                Self::Lifecycle
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Content => "content",
            Self::Conversion => "conversion",
            Self::RateLimit => "rate_limit",
            Self::Blocked => "blocked",
            Self::Channel => "channel",
            Self::Timeout => "timeout",
            Self::Store => "store",
            Self::Scheduler => "scheduler",
            Self::Configuration => "configuration",
            Self::Lifecycle => "lifecycle",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_are_retryable() {
        assert!(DeliveryError::rate_limited(Duration::from_secs(1)).is_retryable());

        assert!(!DeliveryError::blocked(RecipientId(1)).is_retryable());
        assert!(!DeliveryError::network("reset").is_retryable());
        assert!(!DeliveryError::channel(Some(500), "boom").is_retryable());
        assert!(!DeliveryError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(!DeliveryError::content_unavailable("c/1", "empty").is_retryable());
    }

    #[test]
    fn retry_after_is_exposed_for_rate_limits() {
        let error = DeliveryError::rate_limited(Duration::from_millis(1500));
        assert_eq!(error.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(DeliveryError::network("x").retry_after(), None);
    }

    #[test]
    fn categories_render_snake_case() {
        let error = DeliveryError::rate_limited(Duration::from_secs(3));
        assert_eq!(ErrorCategory::from(&error).to_string(), "rate_limit");
        assert_eq!(
            ErrorCategory::from(&DeliveryError::invariant("double release")).to_string(),
            "scheduler"
        );
    }

    #[test]
    fn channel_error_message_includes_status() {
        assert_eq!(
            DeliveryError::channel(Some(400), "bad file").to_string(),
            "channel error (HTTP 400): bad file"
        );
        assert_eq!(DeliveryError::channel(None, "closed").to_string(), "channel error: closed");
    }

    #[test]
    fn core_errors_become_store_errors() {
        let error = DeliveryError::from(CoreError::Database("gone".into()));
        assert!(matches!(error, DeliveryError::StoreError { .. }));
    }
}
