//! Error types for the coordinator

use thiserror::Error;

/// Session, dispatch and storage failures. Session-local errors are also
/// captured in the session's status and surface to the NIP-46 client as
/// an RPC error reply.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("not enough signers online: have {have}, needed {needed}")]
    NotEnoughSigners { have: usize, needed: usize },

    #[error("timeout receiving commits, missing: {0:?}")]
    MissingCommits(Vec<String>),

    #[error("timeout receiving partial signatures, missing: {0:?}")]
    MissingPartials(Vec<String>),

    #[error("got a kind {got} instead of {expected} from {from}")]
    WrongKind { got: u16, expected: u16, from: String },

    #[error("failed to decode commit: {0}")]
    CommitDecode(String),

    #[error("failed to decode partial signature from {0}")]
    PartialDecode(String),

    #[error("participant {id} failed: {reason}")]
    Participant { id: u16, reason: String },

    #[error("signature is bad for unknown reasons")]
    BadAggregate,

    #[error("session channel closed unexpectedly")]
    ChannelClosed,

    #[error("no registration for handler {0}")]
    UnknownHandler(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid rpc payload: {0}")]
    Rpc(String),

    #[error(transparent)]
    Frost(#[from] promenade_frost::FrostError),

    #[error(transparent)]
    Common(#[from] promenade_common::CommonError),

    #[error("store: {0}")]
    Store(String),
}
