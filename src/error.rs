//! Error types for the Reachy bridge

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (startup only, always fatal)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio input device error
    #[error("device error: {0}")]
    Device(String),

    /// Audio processing or output error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("transcription error: {0}")]
    Transcription(#[from] TranscriptionError),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Gateway connection could not be established (retries exhausted)
    #[error("connect error: {0}")]
    Connect(String),

    /// Outbound frame could not be delivered
    #[error("send error: {0}")]
    Send(String),

    /// Peer violated the request/response pairing or sent an unknown frame
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// Action name not known to the executor
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// Robot capability call failed
    #[error("action failed: {0}")]
    ActionFailure(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the error ends the process rather than the current turn
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Connect(_))
    }
}

/// Cause of a failed transcription
#[derive(Debug, Error)]
pub enum TranscriptionError {
    /// Utterance carried no samples
    #[error("empty audio")]
    EmptyAudio,

    /// Backend returned an empty transcript
    #[error("no speech recognized")]
    NoSpeech,

    /// Backend could not be reached
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Backend answered with a non-success status
    #[error("backend error: {0}")]
    Backend(String),

    /// Audio could not be encoded or the response could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}
