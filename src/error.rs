//! Error taxonomy for the client.
//!
//! One enum carries every failure class named in the specification: bad caller
//! input, transport failures from the driver, HTTP-status errors (constructed
//! by middleware via [`ClientError::from_response`], never by the core itself),
//! promise timeouts, wrapped non-error rejections, and aggregate failures.

use thiserror::Error;

use crate::response::Response;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while building, dispatching, or awaiting a request.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    /// Raised synchronously from `request` for unknown methods or URLs that
    /// fail the validation predicate.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The transfer driver reported a transport-level failure (DNS, TCP, TLS,
    /// protocol) for the given request.
    #[error("transport error for {method} {url}: {message}")]
    Transport {
        url: String,
        method: String,
        message: String,
    },

    /// Constructed from a response whose status indicates an error, for
    /// callers that opt into status-based errors via a middleware. The core
    /// never raises this on its own.
    #[error("http error: {method} {url} returned {status}")]
    Http {
        url: String,
        method: String,
        status: u16,
        response: Box<Response>,
    },

    /// Raised by `Promise::wait` when its deadline elapses before settlement.
    #[error("operation timed out")]
    Timeout,

    /// Wraps a non-`ClientError` rejection reason so every promise exposes a
    /// uniform error interface.
    #[error("rejected: {0}")]
    Rejection(String),

    /// Used by `Promise::any` when every input promise rejected.
    #[error("all promises rejected: {0:?}")]
    Aggregate(Vec<ClientError>),
}

impl ClientError {
    /// Build a [`ClientError::Http`] from a response and the request that
    /// produced it. Exposed for middlewares that want status-based
    /// rejection; the core dispatch engine never calls this itself (spec §7).
    pub fn from_response(method: impl Into<String>, url: impl Into<String>, response: Response) -> Self {
        ClientError::Http {
            method: method.into(),
            url: url.into(),
            status: response.status,
            response: Box::new(response),
        }
    }

    /// Wrap an arbitrary displayable rejection reason.
    pub fn rejection(reason: impl std::fmt::Display) -> Self {
        ClientError::Rejection(reason.to_string())
    }

    /// True if this error class originated from the driver, and is therefore
    /// eligible for the retry policy to consider.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }
}

impl From<curl::Error> for ClientError {
    fn from(err: curl::Error) -> Self {
        ClientError::Transport {
            url: String::new(),
            method: String::new(),
            message: err.to_string(),
        }
    }
}

impl From<curl::MultiError> for ClientError {
    fn from(err: curl::MultiError) -> Self {
        ClientError::Transport {
            url: String::new(),
            method: String::new(),
            message: err.to_string(),
        }
    }
}
