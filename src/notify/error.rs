//! Error types for sink delivery.

use thiserror::Error;

/// Error type for HTTP operations.
///
/// Describes what went wrong without dictating recovery strategy.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Network connection failed.
    ///
    /// This includes DNS resolution failures, connection refused,
    /// and other network-level errors.
    #[error("Connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The provided URL is invalid.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Error from a single delivery attempt to one sink.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The HTTP request itself failed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status}{}", body_suffix(.body))]
    NonSuccessStatus {
        /// Status returned by the endpoint.
        status: http::StatusCode,
        /// Response body, when it was valid UTF-8.
        body: Option<String>,
    },

    /// The configured body template failed to render.
    #[error("Template error: {0}")]
    Template(String),

    /// The event could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing to a local stream failed.
    #[error("Write error: {0}")]
    Io(#[from] std::io::Error),

    /// An HTTP sink was configured without a URL.
    #[error("Sink '{0}' has no endpoint")]
    MissingEndpoint(String),

    /// No sink with this name is registered.
    #[error("Unknown sink '{0}'")]
    UnknownSink(String),
}

fn body_suffix(body: &Option<String>) -> String {
    body.as_deref()
        .filter(|b| !b.is_empty())
        .map(|b| format!(": {b}"))
        .unwrap_or_default()
}

/// Extension trait for checking if an error is retryable.
///
/// Determines whether an error represents a transient failure that
/// warrants another delivery attempt.
pub trait IsRetryable {
    /// Returns true if the error is potentially transient and should be retried.
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for HttpError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout => true,
            Self::InvalidUrl(_) => false,
        }
    }
}

impl IsRetryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_retryable(),
            Self::NonSuccessStatus { status, .. } => {
                status.is_server_error()
                    || *status == http::StatusCode::TOO_MANY_REQUESTS
                    || *status == http::StatusCode::REQUEST_TIMEOUT
            }
            Self::Template(_)
            | Self::Encode(_)
            | Self::Io(_)
            | Self::MissingEndpoint(_)
            | Self::UnknownSink(_) => false,
        }
    }
}
