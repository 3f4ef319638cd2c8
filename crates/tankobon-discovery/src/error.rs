//! Errors raised by source providers.

use thiserror::Error;

/// Result type alias for provider calls.
pub type Result<T> = std::result::Result<T, SourceError>;

/// A provider could not answer.
///
/// The discovery loop treats every variant the same way (the URL counts as
/// not updated this cycle); the distinction is for logs and the command
/// surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The upstream site or sidecar could not be reached.
    #[error("request to {provider} failed: {message}")]
    Request {
        /// Provider identifier
        provider: String,
        /// Underlying error
        message: String,
    },

    /// The upstream answered with something we could not read.
    #[error("unexpected response from {provider}: {message}")]
    Parse {
        /// Provider identifier
        provider: String,
        /// What was wrong
        message: String,
    },

    /// The series or item no longer exists.
    #[error("not found: {url}")]
    NotFound {
        /// URL that was requested
        url: String,
    },

    /// No registered provider owns the URL.
    #[error("no provider handles {url}")]
    Unrouted {
        /// URL without an owner
        url: String,
    },
}

impl SourceError {
    /// Creates a request error.
    pub fn request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request { provider: provider.into(), message: message.into() }
    }

    /// Creates a parse error.
    pub fn parse(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse { provider: provider.into(), message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(url: impl Into<String>) -> Self {
        Self::NotFound { url: url.into() }
    }
}
