//! Error type shared by the fallible boundaries of the crate.
//!
//! Routine rejections (stale updates, invalid coordinates, malformed push
//! messages) are not errors and never show up here. See
//! [`ApplyOutcome`](crate::store::ApplyOutcome) for those.

use std::time::Duration;

/// Errors raised by network collaborators or by contract violations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// The push socket failed to connect, or dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The routing backend or poll source answered with an error.
    #[error("backend error: {0}")]
    Backend(String),

    /// A network call exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The caller passed an argument outside the documented contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for FleetError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FleetError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
