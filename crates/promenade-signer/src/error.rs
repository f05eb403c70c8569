//! Error types for the signer daemon

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("data store: {0}")]
    Store(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("refusing to sign: {0}")]
    Refused(String),

    #[error("session {0} ended before completing")]
    SessionAborted(String),

    #[error(transparent)]
    Frost(#[from] promenade_frost::FrostError),

    #[error(transparent)]
    Common(#[from] promenade_common::CommonError),
}
