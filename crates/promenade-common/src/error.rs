//! Error types for the shared layer

use thiserror::Error;

/// Errors from the event model, crypto plumbing and transport contract
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("event id doesn't match its contents")]
    BadEventId,

    #[error("event signature is invalid")]
    BadSignature,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("frost: {0}")]
    Frost(#[from] promenade_frost::FrostError),

    #[error("relay {url}: {reason}")]
    Relay { url: String, reason: String },

    #[error("relay rejected event: {0}")]
    Rejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),
}
