//! Error types for sightline-core
//!
//! None of these ever reach the host through the tracker façade. They flow
//! between the internal layers and are logged (or dropped) at the boundary.

use thiserror::Error;

/// Main error type for the sightline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage is unavailable, full, or disabled
    #[error("storage error: {0}")]
    Storage(String),

    /// Collector answered with a non-success status
    #[error("collector returned HTTP {status}")]
    Http { status: u16 },

    /// Request never produced a response (connect, DNS, timeout)
    #[error("network error: {0}")]
    Network(String),

    /// Body exceeds what the fire-and-forget transport accepts
    #[error("payload of {size} bytes exceeds beacon limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Delivery stopped because tracking is no longer allowed
    #[error("delivery suppressed: {0}")]
    Suppressed(String),
}

impl Error {
    /// Whether a retry of the identical request can succeed.
    ///
    /// Network failures, 5xx and 429 are transient. Every other status is a
    /// client error that the same payload will hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Http { status } => (500..600).contains(status) || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

/// Result type alias for sightline-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("connection reset".to_string()).is_transient());
        assert!(Error::Http { status: 500 }.is_transient());
        assert!(Error::Http { status: 503 }.is_transient());
        assert!(Error::Http { status: 429 }.is_transient());

        assert!(!Error::Http { status: 400 }.is_transient());
        assert!(!Error::Http { status: 401 }.is_transient());
        assert!(!Error::Http { status: 404 }.is_transient());
        assert!(!Error::Storage("quota".to_string()).is_transient());
        assert!(!Error::PayloadTooLarge { size: 10, limit: 5 }.is_transient());
    }
}
