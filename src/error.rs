use config::ConfigError;
use thiserror::Error;

use crate::digest::{DigestError, OciDigest};
use crate::media_type::MediaType;
use crate::reference::ImageReferenceError;
use crate::upload::SessionState;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("unsupported legacy schema 1 manifest: {0}")]
    UnsupportedLegacySchema(MediaType),

    #[error("unexpected media type {actual}: expected {expected}")]
    MediaTypeMismatch {
        expected: &'static str,
        actual: MediaType,
    },

    #[error("mismatched sizes, actual {actual}, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: OciDigest,
        actual: OciDigest,
    },

    #[error("malformed manifest tree: {0}")]
    Structural(String),

    #[error("descriptor {0} was neither image nor index")]
    NeitherArtifactNorCollection(OciDigest),

    #[error("no child manifest matches platform {0}")]
    NoMatchingPlatform(String),

    #[error("cannot {operation} an upload session in state {state}")]
    InvalidSessionState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("cannot truncate upload to offset {offset}, only {written} bytes written")]
    InvalidOffset { offset: u64, written: u64 },

    #[error(transparent)]
    ReferenceParse(#[from] ImageReferenceError),

    #[error(transparent)]
    InvalidDigest(#[from] DigestError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] opendal::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl From<ConfigError> for TransferError {
    fn from(err: ConfigError) -> Self {
        TransferError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transport(err.to_string())
    }
}
