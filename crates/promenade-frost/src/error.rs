//! Error types for FROST operations

use thiserror::Error;

/// Errors that can occur during key dealing, signing and aggregation
#[derive(Debug, Error)]
pub enum FrostError {
    #[error("threshold {threshold} must be between 1 and {max_signers}")]
    InvalidThreshold { threshold: u16, max_signers: u16 },

    #[error("max signers {0} is above the supported limit")]
    TooManySigners(u16),

    #[error("secret scalar is zero")]
    ZeroSecret,

    #[error("identifier can't be zero or bigger than the max number of signers")]
    InvalidIdentifier(u16),

    #[error("duplicate participant {0}")]
    DuplicateParticipant(u16),

    #[error("participant {0} is not part of this configuration")]
    UnknownParticipant(u16),

    #[error("invalid point encoding")]
    InvalidPoint,

    #[error("input too small")]
    TooSmall,

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("key shard secret doesn't match its own public key")]
    SecretMismatch,

    #[error("key shard belongs to a different group public key")]
    WrongGroupKey,

    #[error("invalid number of commitments: {have} (needs at least {min} and at most {max})")]
    InvalidCommitmentCount { have: usize, min: usize, max: usize },

    #[error("commitment for signer {0} is missing")]
    MissingCommitment(u16),

    #[error("group commitment degenerated to the identity point")]
    DegenerateGroupCommitment,

    #[error("invalid signature share")]
    InvalidSignatureShare,

    #[error("no nonces recorded for session {0}")]
    UnknownSession(String),

    #[error("aggregated signature failed verification")]
    BadAggregate,
}
