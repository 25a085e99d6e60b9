// Error types for the collector pipeline
use thiserror::Error;

use crate::events::Channel;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error on channel {channel}: {message}")]
    Parse { channel: Channel, message: String },

    #[error("validation error on channel {channel}: {message}")]
    Validation { channel: Channel, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sink channel closed: {0}")]
    SinkClosed(&'static str),

    #[error("REST snapshot failed for {symbol}: {message}")]
    Snapshot { symbol: String, message: String },

    #[error("shutdown deadline exceeded")]
    ShutdownDeadline,
}

impl CollectorError {
    pub fn parse(channel: Channel, message: impl Into<String>) -> Self {
        Self::Parse {
            channel,
            message: message.into(),
        }
    }

    pub fn validation(channel: Channel, message: impl Into<String>) -> Self {
        Self::Validation {
            channel,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
