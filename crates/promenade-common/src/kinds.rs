//! Event kind numbers used across the signing protocol.
//!
//! The wire kinds keep their historical values. The two process-internal
//! persistence kinds (`STORED_SHARD`, `CLIENT_SECRET_ASSOCIATION`) never
//! travel between peers and sit outside the signing-flow band so they
//! cannot collide with it.

/// Inbox/read relay list, consulted to find a peer's inbox.
pub const KIND_RELAY_LIST: u16 = 10002;

/// User -> coordinator, persistent: the account registration.
pub const KIND_ACCOUNT_REGISTRATION: u16 = 16430;

/// Relay client authentication handshake event.
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// NIP-46 remote-signer RPC envelope.
pub const KIND_NOSTR_CONNECT: u16 = 24133;

/// Internal signer persistence of an accepted shard.
pub const KIND_STORED_SHARD: u16 = 26420;

/// Internal coordinator record binding a client pubkey to a profile
/// secret; replaceable, latest association wins.
pub const KIND_CLIENT_SECRET_ASSOCIATION: u16 = 26421;

/// User -> signer, ephemeral: an encrypted shard delivery.
pub const KIND_SHARD: u16 = 26428;

/// Signer -> user and coordinator -> signer: shard acknowledgement.
pub const KIND_SHARD_ACK: u16 = 26429;

/// Coordinator -> signers: round-opening configuration.
pub const KIND_CONFIGURATION: u16 = 26430;

/// Signer -> coordinator: binonce commitment.
pub const KIND_COMMIT: u16 = 26431;

/// Coordinator -> signers: aggregated group binonce.
pub const KIND_GROUP_COMMIT: u16 = 26432;

/// Coordinator -> signers: the event to be signed, as JSON.
pub const KIND_EVENT_TO_BE_SIGNED: u16 = 26433;

/// Signer -> coordinator: partial signature.
pub const KIND_PARTIAL_SIGNATURE: u16 = 26434;

/// Kinds the group must never sign, enforced independently by the
/// coordinator authorization layer, the NIP-46 hook and each signer.
pub const FORBIDDEN_KINDS: [u16; 3] = [KIND_ACCOUNT_REGISTRATION, 1776, 1777];

/// The client-auth challenge prefix that marks an attempt to use the
/// bunker to forge an authentication at its own coordinator.
pub const BUNKER_CHALLENGE_PREFIX: &str = "frostbunker:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_kinds_stay_out_of_the_signing_band() {
        for internal in [KIND_STORED_SHARD, KIND_CLIENT_SECRET_ASSOCIATION] {
            assert!(!(KIND_SHARD..=KIND_PARTIAL_SIGNATURE).contains(&internal));
        }
    }

    #[test]
    fn registration_kind_is_forbidden_to_sign() {
        assert!(FORBIDDEN_KINDS.contains(&KIND_ACCOUNT_REGISTRATION));
    }
}
