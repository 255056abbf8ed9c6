// conveyor-core/src/error.rs
use thiserror::Error;

/// Invalid options at initialization. Fatal: the adapter never starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("missing option: {0}")]
    MissingOption(String),
}

/// Failure while opening the connection/channel or starting the subscription.
///
/// Retryable failures drive the backoff policy; anything the client cannot
/// classify is escalated as fatal so a misconfiguration is not masked as a
/// transient outage.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect failed: {0}")]
    Retryable(String),

    #[error("connect failed (not retryable): {0}")]
    Fatal(String),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Retryable(_))
    }
}

/// Failure of a single broker call on an established channel, including
/// calls issued against a handle whose channel is no longer live.
#[derive(Debug, Error)]
#[error("broker call failed: {0}")]
pub struct BrokerError(pub String);
