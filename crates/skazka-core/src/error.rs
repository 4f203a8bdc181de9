//! Error types for the story session core

use thiserror::Error;

/// Result type alias for story operations
pub type StoryResult<T> = Result<T, StoryError>;

/// Errors that can occur while generating, narrating, or persisting stories
#[derive(Error, Debug)]
pub enum StoryError {
    #[error("Generation backend error: {0}")]
    Generation(String),

    #[error("Malformed story payload: {0}")]
    MalformedPayload(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Session gateway error: {0}")]
    Gateway(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Mirror store error: {0}")]
    Mirror(String),

    #[error("Audio payload error: {0}")]
    Audio(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoryError {
    fn from(err: serde_json::Error) -> Self {
        StoryError::MalformedPayload(err.to_string())
    }
}

impl From<sled::Error> for StoryError {
    fn from(err: sled::Error) -> Self {
        StoryError::Mirror(err.to_string())
    }
}
