//! Error taxonomy — classifies internal failures and renders them as wire
//! error frames.

use thiserror::Error;

use crate::protocol::{ErrorPayload, Stage};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("invalid command payload: {0}")]
    InvalidCommand(String),

    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("audio chunk out of order: got {got}, last was {last}")]
    ChunkOutOfOrder { last: u64, got: u64 },

    #[error("unsupported {kind} provider: {name}")]
    UnsupportedProvider { kind: &'static str, name: String },

    #[error("{stage} backend unreachable: {message}")]
    ProviderUnreachable {
        stage: Stage,
        message: String,
        /// Failures during engine initialization are not recoverable.
        during_init: bool,
    },

    #[error("{stage} call timed out")]
    ProviderTimeout { stage: Stage },

    #[error("{stage} failed: {message}")]
    StageFailed { stage: Stage, message: String },

    /// Not an error to the client; the pipeline terminates silently.
    #[error("pipeline cancelled")]
    Cancelled,

    #[error("session limit exceeded")]
    SessionLimitExceeded,

    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Wire error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_INVALID",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::InvalidAudio(_) => "INVALID_AUDIO_DATA",
            Self::InvalidCommand(_) => "INVALID_COMMAND_DATA",
            Self::UnsupportedMessageType(_) => "UNSUPPORTED_MESSAGE_TYPE",
            Self::UnsupportedCommand(_) => "UNSUPPORTED_COMMAND",
            Self::ChunkOutOfOrder { .. } => "CHUNK_OUT_OF_ORDER",
            Self::UnsupportedProvider { .. } => "UNSUPPORTED_PROVIDER",
            Self::ProviderUnreachable { .. } => "PROVIDER_UNREACHABLE",
            // Stage timeouts surface under the stage's failure code so the
            // client sees which stage of the turn went wrong.
            Self::ProviderTimeout { stage } | Self::StageFailed { stage, .. } => {
                stage.failure_code()
            }
            Self::Cancelled => "CANCELLED",
            Self::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
            Self::ConnectionLimitExceeded => "CONNECTION_LIMIT_EXCEEDED",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the session survives this error in a usable state.
    pub fn recoverable(&self) -> bool {
        match self {
            Self::MalformedFrame(_)
            | Self::InvalidAudio(_)
            | Self::InvalidCommand(_)
            | Self::UnsupportedMessageType(_)
            | Self::UnsupportedCommand(_)
            | Self::ChunkOutOfOrder { .. }
            | Self::ProviderTimeout { .. }
            | Self::StageFailed { .. }
            | Self::Cancelled
            | Self::SessionLimitExceeded => true,
            Self::ProviderUnreachable { during_init, .. } => !during_init,
            Self::Config(_)
            | Self::UnsupportedProvider { .. }
            | Self::ConnectionLimitExceeded
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Json(_) => false,
        }
    }

    /// Render as a wire error payload.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            details: None,
        }
    }
}
