//! # Promenade Signer
//!
//! A signer daemon holds secret key shards for any number of groups,
//! one per user who dealt to it. It accepts new shards through a
//! proof-of-work-gated handshake, pins the coordinator named in each
//! shard on first use, and then subscribes at every known coordinator
//! for signing rounds, producing one partial signature per session.

pub mod acceptor;
pub mod error;
pub mod guard;
pub mod run;
pub mod store;

pub use acceptor::{run_acceptor, AcceptorConfig};
pub use error::SignerError;
pub use guard::refuse_reason;
pub use run::run_signer;
pub use store::{KeyGroup, ShardStore};
