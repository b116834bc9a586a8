use thiserror::Error;

use crate::peer::types::{Role, SignalingPhase};

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the session layer.
///
/// None of these tear down the session object; only the operation that
/// produced the error fails.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed session blob: {0}")]
    MalformedBlob(String),

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("transport degraded: {0}")]
    TransportDegraded(String),

    #[error("reconnection failed: {0}")]
    Reconnection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation not allowed in phase {actual:?} (expected {expected})")]
    InvalidPhase {
        expected: &'static str,
        actual: SignalingPhase,
    },

    #[error("operation requires role {required:?}, session is {actual:?}")]
    RoleMismatch { required: Role, actual: Option<Role> },

    #[error("channel '{0}' is not open")]
    ChannelNotOpen(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// File-transfer specific failures, one job per direction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("a {0} job is already active")]
    JobActive(&'static str),

    #[error("received {received} bytes but only {declared} were declared")]
    Oversize { declared: u64, received: u64 },

    #[error("announced file of {declared} bytes exceeds the {limit} byte limit")]
    TooLarge { declared: u64, limit: u64 },

    #[error("declared {declared} bytes but received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("content digest mismatch (expected {expected}, got {actual})")]
    DigestMismatch { expected: String, actual: String },

    #[error("channel failure: {0}")]
    Channel(String),
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
