// =============================================================================
// error.rs — WHAT WENT WRONG, AND WHETHER TO TRY AGAIN
// =============================================================================
//
// Every handler error lands in one of three buckets:
//
// 1. Transient — the store or broker could not be reached. The stream entry
//    stays unacknowledged and comes back on redelivery.
// 2. Data — the payload is malformed or points at something that does not
//    exist. Redelivery would fail the same way, so the entry is dropped.
// 3. External — the text generation capability misbehaved. The insight
//    report is marked FAILED and the entry is acknowledged.
// =============================================================================

use thiserror::Error;

/// Document store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt document '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("document encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("broker not connected")]
    NotConnected,

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Text generation failures.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("text generation is not configured")]
    NotConfigured,

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("text generation timed out after {0}s")]
    Timeout(u64),

    #[error("text generation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("text generation endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("text generation returned no usable text")]
    EmptyResponse,
}

impl GenerationError {
    /// Whether another attempt at the same prompt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout(_) | GenerationError::Transport(_) => true,
            GenerationError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Outcome classification for a single routed event.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("bad event: {0}")]
    Data(String),

    #[error("external capability failed: {0}")]
    External(#[from] GenerationError),
}

impl HandlerError {
    pub fn data(msg: impl Into<String>) -> Self {
        HandlerError::Data(msg.into())
    }

    /// Transient errors leave the entry pending for redelivery. Everything
    /// else is acknowledged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(e) => HandlerError::Transient(e.to_string()),
            StoreError::Unavailable(msg) => HandlerError::Transient(msg),
            other => HandlerError::Data(other.to_string()),
        }
    }
}

impl From<BrokerError> for HandlerError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Encoding(e) => HandlerError::Data(e.to_string()),
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Data(format!("malformed payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_payload_is_not_retryable() {
        let err: HandlerError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_broker_outage_is_retryable() {
        let err: HandlerError = BrokerError::NotConnected.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_generation_retry_classification() {
        assert!(GenerationError::Timeout(30).is_retryable());
        assert!(GenerationError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!GenerationError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!GenerationError::EmptyResponse.is_retryable());
    }
}
