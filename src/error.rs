// =============================================================================
// SDK error taxonomy
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// All failures surfaced by the SDK.
///
/// Cloneable so that a single underlying failure (e.g. a coalesced registry
/// fetch) can be handed to every caller awaiting it.
#[derive(Debug, Clone, Error)]
pub enum SdkError {
    /// Connection loss or HTTP failure at the transport boundary.
    #[error("transport error: {0}")]
    Transport(String),

    /// A wait or RPC deadline expired.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The trade server rejected a request.
    #[error("trade failed with {string_code} ({numeric_code}): {message}")]
    Trade {
        numeric_code: i64,
        string_code: String,
        message: String,
    },

    /// Malformed input to the trade facade.
    #[error("validation error: {0}")]
    Validation(String),

    /// A bug or broken invariant inside the SDK.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SdkError {
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SdkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}
