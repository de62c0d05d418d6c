//! Error types for the Courier HTTP client
//!
//! This module defines the error surface shared across the Courier crates,
//! with a focus on clear failure modes and a precise notion of which
//! transport failures are safe to retry.

use thiserror::Error;

/// Main error type for Courier operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// Cancellation observed while waiting for a pooled connection
    #[error("connection acquisition cancelled for {endpoint}")]
    AcquireCancelled { endpoint: String },

    /// Cancellation observed outside the acquisition wait
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Dial or handshake did not complete within the connect timeout
    #[error("connect to {endpoint} timed out after {elapsed_ms}ms")]
    ConnectTimeout { endpoint: String, elapsed_ms: u64 },

    /// I/O failure on a connection
    #[error("transport error on {endpoint}: {message}")]
    Transport {
        endpoint: String,
        message: String,
        retryable: bool,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The proxy refused the `CONNECT` tunnel
    #[error("proxy {proxy} rejected tunnel with status {status}")]
    TunnelRejected { proxy: String, status: u16 },

    /// TLS negotiation failed
    #[error("TLS handshake with {host} failed: {message}")]
    TlsHandshake {
        host: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected bytes on an idle connection or a framing error
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// Operation against a disposed pool or manager
    #[error("{component} is disposed")]
    Disposed { component: String },

    /// The request cannot be classified or encoded
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

/// Result type alias for Courier operations
pub type CourierResult<T> = Result<T, CourierError>;

impl CourierError {
    /// Determine if this error may be recovered by re-sending the request
    /// on a different connection
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    /// Determine if this error was caused by cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::AcquireCancelled { .. } | Self::Cancelled { .. })
    }

    /// Create a non-retryable transport error
    pub fn transport(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: source.to_string(),
            retryable: false,
            source: Some(source),
        }
    }

    /// Create a transport error whose retryability was decided by the caller
    pub fn transport_with_retry(
        endpoint: impl Into<String>,
        source: std::io::Error,
        retryable: bool,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: source.to_string(),
            retryable,
            source: Some(source),
        }
    }

    /// Create a transport error from a bare message
    pub fn transport_msg(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Create a connect timeout error
    pub fn connect_timeout(endpoint: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::ConnectTimeout {
            endpoint: endpoint.into(),
            elapsed_ms,
        }
    }

    /// Create a TLS handshake error
    pub fn tls(
        host: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TlsHandshake {
            host: host.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a disposed error
    pub fn disposed(component: impl Into<String>) -> Self {
        Self::Disposed {
            component: component.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}
