//! Crate-wide error taxonomy. Every fallible core operation returns `Result<T, CoreError>`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("network error: {0}")]
    Network(String),

    #[error("exchange api error {code}: {msg}")]
    Api { code: String, msg: String },

    #[error("pre-trade check rejected: {reason}")]
    RiskReject { reason: String },

    #[error("insufficient capital: {0}")]
    InsufficientCapital(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("event queue full")]
    QueueFull,

    #[error("meltdown active: {0}")]
    Meltdown(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
