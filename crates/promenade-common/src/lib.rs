//! # Promenade Common
//!
//! The pieces every Promenade role shares: the Nostr-style event model
//! with canonical ids and BIP-340 signatures, the event kinds of the
//! signing protocol, the account-registration codec, proof-of-work,
//! encrypted direct payloads, and the relay transport contract with an
//! in-memory implementation for tests and local simulation.

pub mod bus;
pub mod crypto;
pub mod error;
pub mod event;
pub mod filter;
pub mod kinds;
pub mod net;
pub mod pow;
pub mod registration;

pub use bus::{MemoryRelay, Relay, RelayInfo};
pub use net::WsPool;
pub use error::CommonError;
pub use event::{Event, Keys};
pub use filter::Filter;
pub use registration::{
    bunker_url, new_profile_secret, AccountProfile, AccountRegistration, ProfileRestrictions,
    RegisteredSigner, RegistrationError, PROFILE_ROOT,
};

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Well-known indexer relays consulted for kind-10002 relay lists.
pub const INDEX_RELAYS: &[&str] = &[
    "wss://purplepag.es",
    "wss://relay.nostr.band",
    "wss://indexer.coracle.social",
];

/// Current unix time in seconds.
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
