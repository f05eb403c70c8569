//! # Promenade FROST
//!
//! FROST (Flexible Round-Optimized Schnorr Threshold) signatures over
//! secp256k1, normalized so that aggregated signatures are plain BIP-340
//! Schnorr signatures indistinguishable from single-key ones.
//!
//! This crate provides:
//! - **Trusted key dealing**: split a master scalar into t-of-n shards
//!   with a Feldman VSS commitment vector
//! - **Signing rounds**: per-session binonce commitments, the binding
//!   coefficient, partial signatures and their verification
//! - **Aggregation**: summing partial signatures into a 64-byte BIP-340
//!   signature, with per-participant blame on failure
//!
//! The coordinator drives [`Configuration::group_commitment`],
//! [`Configuration::verify_partial_signature`] and
//! [`Configuration::aggregate_signatures`]; each participant drives a
//! [`Signer`]. None of the operations here suspend or do I/O.

pub mod commitment;
pub mod configuration;
pub mod curve;
pub mod error;
pub mod keys;
pub mod lambda;
pub mod sign;

pub use commitment::{BinoncePublic, BinonceSecret, Commitment};
pub use configuration::Configuration;
pub use error::FrostError;
pub use keys::{trusted_deal, KeyShard, PublicKeyShard, MAX_SIGNERS};
pub use lambda::{compute_lambda, LambdaRegistry};
pub use sign::{challenge, GroupCommitment, PartialSignature, Signer};

/// Result type alias for FROST operations
pub type Result<T> = std::result::Result<T, FrostError>;
