use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when talking to the remote tracker.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Request was rejected as malformed (HTTP 400/422).
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Request conflicts with remote state (HTTP 409).
    #[error("Constraint violation: {message}")]
    Constraint { message: String },

    /// Rate limit exceeded (HTTP 429).
    #[error("Rate limit exceeded{}", reset_at.map(|t| format!(". Resets at {t}")).unwrap_or_default())]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Authentication required or failed (HTTP 401/403).
    #[error("Authentication required")]
    AuthRequired,

    /// Resource not found (HTTP 404).
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Remote server failure (HTTP 5xx).
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Any other unexpected HTTP status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network or connection error.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The request did not complete in time.
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Response body could not be decoded.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Unexpected/internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RemoteError {
    /// Create a validation error.
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error.
    #[inline]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a network error.
    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a server error.
    #[inline]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Create a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 422 => Self::Validation { message },
            401 | 403 => Self::AuthRequired,
            404 => Self::NotFound { resource: message },
            409 => Self::Constraint { message },
            429 => Self::RateLimited { reset_at: None },
            500..=599 => Self::Server { status, message },
            _ => Self::Api { status, message },
        }
    }

    /// Check if this error is a rate limit error.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// When the remote quota resets, if the error carries it.
    #[inline]
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { reset_at } => *reset_at,
            _ => None,
        }
    }
}

/// Extract a short error message suitable for display.
///
/// Takes the first line of an error message, which keeps multi-line
/// response bodies out of progress events and log lines.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;
