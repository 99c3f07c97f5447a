//! Error types for the narrator core

use streampal_voice::VoiceError;
use thiserror::Error;

pub type PalResult<T> = Result<T, PalError>;

#[derive(Error, Debug)]
pub enum PalError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Queue closed: {0}")]
    QueueClosed(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Voice(#[from] VoiceError),
}
