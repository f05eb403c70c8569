//! # Promenade Coordinator
//!
//! The coordinator is a relay with opinions: it stores exactly one kind
//! of persistent event (account registrations), admits exactly the
//! subscription shapes the signing protocol needs, answers NIP-46
//! requests on behalf of registered groups, and orchestrates the FROST
//! signing rounds against whichever registered signers are online.
//!
//! The WebSocket/HTTP glue lives in [`server`]; everything else is
//! transport-agnostic and reachable in-process through
//! [`relay::LocalClient`], which is how the integration tests drive a
//! real coordinator without a socket.

pub mod authz;
pub mod error;
pub mod ingress;
pub mod nip46;
pub mod ratelimit;
pub mod relay;
pub mod server;
pub mod session;
pub mod settings;
pub mod store;

pub use error::CoordinatorError;
pub use relay::{Coordinator, LocalClient};
pub use session::{GroupContext, Session, SessionStatus};
pub use settings::Settings;
pub use store::Store;
