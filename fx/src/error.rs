//! Rate fetch error types.

use thiserror::Error;

/// Errors that can occur while fetching exchange rates.
///
/// None of these are fatal to the service: the cache keeps serving the
/// previous snapshot.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, DNS or TLS failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream did not answer in time.
    #[error("Rate request timed out after {0}ms")]
    Timeout(u64),

    /// Upstream answered with a non-2xx status.
    #[error("Upstream returned status {0}")]
    Status(u16),

    /// Body was not the expected JSON shape.
    #[error("Malformed response: {0}")]
    Decode(String),

    /// A rate value was not a positive number.
    #[error("Invalid rate for {currency}: {value:?}")]
    InvalidRate { currency: String, value: String },

    /// Provider is switched off.
    #[error("Rate provider unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Result type for rate fetching.
pub type FetchResult<T> = Result<T, FetchError>;
