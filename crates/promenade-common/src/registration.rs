//! The account-registration codec: a registration carried as a signed
//! event of kind [`crate::kinds::KIND_ACCOUNT_REGISTRATION`].

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use promenade_frost::PublicKeyShard;

use crate::event::{Event, Keys};
use crate::kinds::KIND_ACCOUNT_REGISTRATION;

/// The unrestricted profile created at registration time.
pub const PROFILE_ROOT: &str = "__root__";

/// Decode failures, one kind per way a registration event can be broken.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("wrong kind {0}, expected {KIND_ACCOUNT_REGISTRATION}")]
    WrongKind(u16),

    #[error("missing '{0}' tag")]
    MissingTag(&'static str),

    #[error("invalid 'handlersecret'")]
    InvalidHandlerSecret,

    #[error("'h' tag pubkey doesn't match 'handlersecret'")]
    HandlerMismatch,

    #[error("'threshold' ('{0}') is not a valid number")]
    InvalidThreshold(String),

    #[error("invalid signer tag: {0}")]
    InvalidSignerTag(String),

    #[error("invalid encoded shard: {0}")]
    ShardDecode(String),

    #[error("missing signers")]
    NotEnoughSigners,

    #[error("invalid profile tag length: 4 expected, got {0}")]
    InvalidProfileTag(usize),

    #[error("invalid restrictions")]
    InvalidRestrictions,

    #[error("must have at least one profile")]
    NoProfiles,
}

/// Per-profile signing policy. Empty/zero fields don't constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRestrictions {
    /// Event kinds this profile may sign; empty means every kind.
    #[serde(rename = "k", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_kinds: Vec<u16>,
    /// Unix-seconds expiry; zero means never.
    #[serde(rename = "u", default)]
    pub expires_at: u64,
}

/// A named credential authorizing a class of signing requests.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountProfile {
    pub name: String,
    /// Lowercase base32 of random bytes, handed to clients in bunker URLs.
    pub secret: String,
    pub restrictions: Option<ProfileRestrictions>,
}

/// One registered signer: its permanent peer key (unrelated to FROST)
/// and the public half of its shard.
#[derive(Debug, Clone)]
pub struct RegisteredSigner {
    pub peer_pubkey: String,
    pub shard: PublicKeyShard,
}

/// The canonical account record a coordinator keeps per registered user.
#[derive(Debug, Clone)]
pub struct AccountRegistration {
    /// The aggregated group pubkey; equals the registration event author.
    pub pubkey: String,
    /// The keypair the coordinator uses to handle NIP-46 traffic for
    /// this group; created by the user, the coordinator is merely told.
    pub handler_secret: Keys,
    pub threshold: u16,
    pub signers: Vec<RegisteredSigner>,
    pub profiles: Vec<AccountProfile>,
}

impl AccountRegistration {
    /// Decode and validate a registration event. The author key is taken
    /// as the group's aggregate pubkey; no cross-check against the
    /// shards happens here (the dealer does that at deal time).
    pub fn decode(event: &Event) -> Result<Self, RegistrationError> {
        if event.kind != KIND_ACCOUNT_REGISTRATION {
            return Err(RegistrationError::WrongKind(event.kind));
        }

        let handler_secret = {
            let tag = event
                .find_tag("handlersecret")
                .ok_or(RegistrationError::MissingTag("handlersecret"))?;
            let secret_hex = tag.get(1).ok_or(RegistrationError::InvalidHandlerSecret)?;
            let keys =
                Keys::parse(secret_hex).map_err(|_| RegistrationError::InvalidHandlerSecret)?;

            let h_tag = event.find_tag("h").ok_or(RegistrationError::MissingTag("h"))?;
            if h_tag.get(1).map(|s| s.as_str()) != Some(keys.public_key().as_str()) {
                return Err(RegistrationError::HandlerMismatch);
            }
            keys
        };

        let threshold = {
            let tag = event
                .find_tag("threshold")
                .ok_or(RegistrationError::MissingTag("threshold"))?;
            let raw = tag.get(1).map(|s| s.as_str()).unwrap_or("");
            let threshold: u16 = raw
                .parse()
                .map_err(|_| RegistrationError::InvalidThreshold(raw.to_string()))?;
            if threshold == 0 || threshold > 20 {
                return Err(RegistrationError::InvalidThreshold(raw.to_string()));
            }
            threshold
        };

        let mut signers = Vec::new();
        for tag in event.tags_named("p") {
            if tag.len() != 3 {
                return Err(RegistrationError::InvalidSignerTag(tag.join(",")));
            }
            if hex::decode(&tag[1]).map(|b| b.len()).unwrap_or(0) != 32 {
                return Err(RegistrationError::InvalidSignerTag(tag[1].clone()));
            }
            let shard = PublicKeyShard::decode_hex(&tag[2])
                .map_err(|e| RegistrationError::ShardDecode(e.to_string()))?;
            signers.push(RegisteredSigner {
                peer_pubkey: tag[1].clone(),
                shard,
            });
        }
        if signers.len() < threshold as usize {
            return Err(RegistrationError::NotEnoughSigners);
        }

        let mut profiles = Vec::new();
        for tag in event.tags_named("profile") {
            if tag.len() != 4 {
                return Err(RegistrationError::InvalidProfileTag(tag.len()));
            }
            let restrictions = if tag[3].is_empty() {
                None
            } else {
                Some(
                    serde_json::from_str(&tag[3])
                        .map_err(|_| RegistrationError::InvalidRestrictions)?,
                )
            };
            profiles.push(AccountProfile {
                name: tag[1].clone(),
                secret: tag[2].clone(),
                restrictions,
            });
        }
        if profiles.is_empty() {
            return Err(RegistrationError::NoProfiles);
        }

        Ok(AccountRegistration {
            pubkey: event.pubkey.clone(),
            handler_secret,
            threshold,
            signers,
            profiles,
        })
    }

    /// Build the unsigned registration event; the caller signs it with
    /// the group's master key.
    pub fn encode(&self) -> Event {
        let mut tags = Vec::with_capacity(3 + self.signers.len() + self.profiles.len());
        tags.push(vec!["threshold".into(), self.threshold.to_string()]);
        tags.push(vec!["handlersecret".into(), self.handler_secret.secret_hex()]);
        tags.push(vec!["h".into(), self.handler_secret.public_key()]);
        for signer in &self.signers {
            tags.push(vec![
                "p".into(),
                signer.peer_pubkey.clone(),
                signer.shard.hex(),
            ]);
        }
        for profile in &self.profiles {
            let restrictions_json = profile
                .restrictions
                .as_ref()
                .map(|r| serde_json::to_string(r).unwrap_or_default())
                .unwrap_or_default();
            tags.push(vec![
                "profile".into(),
                profile.name.clone(),
                profile.secret.clone(),
                restrictions_json,
            ]);
        }

        let mut event = Event::new(KIND_ACCOUNT_REGISTRATION, "", tags);
        event.pubkey = self.pubkey.clone();
        event
    }

    pub fn handler_pubkey(&self) -> String {
        self.handler_secret.public_key()
    }

    pub fn profile_by_secret(&self, secret: &str) -> Option<&AccountProfile> {
        self.profiles.iter().find(|p| p.secret == secret)
    }

    pub fn signer_by_peer(&self, peer_pubkey: &str) -> Option<&RegisteredSigner> {
        self.signers.iter().find(|s| s.peer_pubkey == peer_pubkey)
    }
}

/// A fresh profile secret: 10 random bytes, lowercase base32.
pub fn new_profile_secret() -> String {
    let mut bytes = [0u8; 10];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase()
}

/// `bunker://<handler_pub>?relay=<coordinator>&secret=<profile_secret>`
pub fn bunker_url(handler_pubkey: &str, coordinator_url: &str, secret: &str) -> String {
    format!("bunker://{handler_pubkey}?relay={coordinator_url}&secret={secret}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::Scalar;
    use promenade_frost::trusted_deal;

    fn sample_registration() -> AccountRegistration {
        let (shards, _, _) = trusted_deal(&Scalar::from(42u64), 2, 3).unwrap();
        AccountRegistration {
            pubkey: "ee".repeat(32),
            handler_secret: Keys::generate(),
            threshold: 2,
            signers: shards
                .iter()
                .map(|shard| RegisteredSigner {
                    peer_pubkey: Keys::generate().public_key(),
                    shard: shard.public.clone(),
                })
                .collect(),
            profiles: vec![AccountProfile {
                name: PROFILE_ROOT.into(),
                secret: new_profile_secret(),
                restrictions: None,
            }],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let registration = sample_registration();
        let event = registration.encode();
        let decoded = AccountRegistration::decode(&event).unwrap();

        assert_eq!(decoded.pubkey, registration.pubkey);
        assert_eq!(decoded.threshold, registration.threshold);
        assert_eq!(decoded.handler_pubkey(), registration.handler_pubkey());
        assert_eq!(decoded.signers.len(), 3);
        assert_eq!(decoded.profiles, registration.profiles);
        for (a, b) in decoded.signers.iter().zip(&registration.signers) {
            assert_eq!(a.peer_pubkey, b.peer_pubkey);
            assert_eq!(a.shard, b.shard);
        }
    }

    #[test]
    fn restrictions_survive_the_json_tag() {
        let mut registration = sample_registration();
        registration.profiles.push(AccountProfile {
            name: "blog".into(),
            secret: new_profile_secret(),
            restrictions: Some(ProfileRestrictions {
                allowed_kinds: vec![30023],
                expires_at: 9999999999,
            }),
        });
        let decoded = AccountRegistration::decode(&registration.encode()).unwrap();
        let profile = decoded.profiles.iter().find(|p| p.name == "blog").unwrap();
        assert_eq!(
            profile.restrictions,
            Some(ProfileRestrictions {
                allowed_kinds: vec![30023],
                expires_at: 9999999999,
            })
        );
    }

    #[test]
    fn decode_failures_are_specific() {
        let registration = sample_registration();

        let mut wrong_kind = registration.encode();
        wrong_kind.kind = 1;
        assert!(matches!(
            AccountRegistration::decode(&wrong_kind),
            Err(RegistrationError::WrongKind(1))
        ));

        let mut missing_handler = registration.encode();
        missing_handler.tags.retain(|t| t[0] != "handlersecret");
        assert!(matches!(
            AccountRegistration::decode(&missing_handler),
            Err(RegistrationError::MissingTag("handlersecret"))
        ));

        let mut mismatched = registration.encode();
        for tag in mismatched.tags.iter_mut() {
            if tag[0] == "h" {
                tag[1] = "aa".repeat(32);
            }
        }
        assert!(matches!(
            AccountRegistration::decode(&mismatched),
            Err(RegistrationError::HandlerMismatch)
        ));

        let mut bad_threshold = registration.encode();
        for tag in bad_threshold.tags.iter_mut() {
            if tag[0] == "threshold" {
                tag[1] = "21".into();
            }
        }
        assert!(matches!(
            AccountRegistration::decode(&bad_threshold),
            Err(RegistrationError::InvalidThreshold(_))
        ));

        let mut no_profiles = registration.encode();
        no_profiles.tags.retain(|t| t[0] != "profile");
        assert!(matches!(
            AccountRegistration::decode(&no_profiles),
            Err(RegistrationError::NoProfiles)
        ));

        let mut short_signers = registration.encode();
        short_signers.tags.retain(|t| t[0] != "p");
        assert!(matches!(
            AccountRegistration::decode(&short_signers),
            Err(RegistrationError::NotEnoughSigners)
        ));
    }

    #[test]
    fn profile_secrets_are_lowercase_base32() {
        let secret = new_profile_secret();
        assert_eq!(secret.len(), 16);
        assert!(secret
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn bunker_url_shape() {
        let url = bunker_url("aabb", "wss://relay.example.com", "s3cret");
        assert_eq!(url, "bunker://aabb?relay=wss://relay.example.com&secret=s3cret");
    }
}
