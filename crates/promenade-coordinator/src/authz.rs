//! The authorization envelope around `sign_event`: profile secrets,
//! per-profile restrictions, and the forbidden-signing rules that stop a
//! bunker client from subverting the coordinator or the group.

use tracing::warn;

use promenade_common::kinds::{BUNKER_CHALLENGE_PREFIX, FORBIDDEN_KINDS, KIND_CLIENT_AUTH};
use promenade_common::{now, AccountRegistration, Event};

use crate::store::Store;

/// Kinds and shapes the group must never sign, regardless of profile.
/// The signers run their own copy of this check.
pub fn forbidden(event: &Event) -> bool {
    if FORBIDDEN_KINDS.contains(&event.kind) {
        return true;
    }
    if event.kind == KIND_CLIENT_AUTH {
        if let Some(challenge) = event.tag_value("challenge") {
            if challenge.starts_with(BUNKER_CHALLENGE_PREFIX) {
                return true;
            }
        }
    }
    false
}

/// Whether `from` may have `event` signed by this group: the client's
/// associated secret must match one of the registration's profiles, and
/// that profile's restrictions must allow the event.
pub fn authorize(
    store: &Store,
    registration: &AccountRegistration,
    event: &Event,
    from: &str,
) -> bool {
    if forbidden(event) {
        return false;
    }

    let Some(secret) = store.association(from, &registration.pubkey) else {
        warn!(client = %from, user = %registration.pubkey, "no secret associated");
        return false;
    };

    let Some(profile) = registration.profile_by_secret(&secret) else {
        return false;
    };

    match &profile.restrictions {
        None => true,
        Some(restrictions) => {
            let expiry_ok = restrictions.expires_at == 0
                || (restrictions.expires_at > now()
                    && restrictions.expires_at > event.created_at);
            let kind_ok = restrictions.allowed_kinds.is_empty()
                || restrictions.allowed_kinds.contains(&event.kind);
            expiry_ok && kind_ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promenade_common::kinds::KIND_ACCOUNT_REGISTRATION;
    use promenade_common::{
        new_profile_secret, AccountProfile, Keys, ProfileRestrictions, PROFILE_ROOT,
    };

    fn registration_with_profiles(profiles: Vec<AccountProfile>) -> AccountRegistration {
        AccountRegistration {
            pubkey: "ab".repeat(32),
            handler_secret: Keys::generate(),
            threshold: 2,
            signers: vec![],
            profiles,
        }
    }

    fn kind_event(kind: u16) -> Event {
        Event::new(kind, "content", vec![])
    }

    #[test]
    fn root_profile_signs_anything_outside_the_forbidden_set() {
        let store = Store::in_memory();
        let root_secret = new_profile_secret();
        let registration = registration_with_profiles(vec![AccountProfile {
            name: PROFILE_ROOT.into(),
            secret: root_secret.clone(),
            restrictions: None,
        }]);
        store.put_association("client", &registration.pubkey, &root_secret);

        assert!(authorize(&store, &registration, &kind_event(1), "client"));
        assert!(authorize(&store, &registration, &kind_event(30023), "client"));
        assert!(!authorize(
            &store,
            &registration,
            &kind_event(KIND_ACCOUNT_REGISTRATION),
            "client"
        ));
        assert!(!authorize(&store, &registration, &kind_event(1776), "client"));
    }

    #[test]
    fn kind_restricted_profile() {
        let store = Store::in_memory();
        let secret = new_profile_secret();
        let registration = registration_with_profiles(vec![AccountProfile {
            name: "notes".into(),
            secret: secret.clone(),
            restrictions: Some(ProfileRestrictions {
                allowed_kinds: vec![1],
                expires_at: 0,
            }),
        }]);
        store.put_association("client", &registration.pubkey, &secret);

        assert!(authorize(&store, &registration, &kind_event(1), "client"));
        assert!(!authorize(&store, &registration, &kind_event(7), "client"));
    }

    #[test]
    fn long_form_profile_signs_only_long_form() {
        let store = Store::in_memory();
        let secret = new_profile_secret();
        let registration = registration_with_profiles(vec![AccountProfile {
            name: "articles".into(),
            secret: secret.clone(),
            restrictions: Some(ProfileRestrictions {
                allowed_kinds: vec![30023],
                expires_at: 9999999999,
            }),
        }]);
        store.put_association("client", &registration.pubkey, &secret);

        assert!(!authorize(&store, &registration, &kind_event(1), "client"));
        assert!(authorize(&store, &registration, &kind_event(30023), "client"));
    }

    #[test]
    fn expired_profile_cannot_sign() {
        let store = Store::in_memory();
        let secret = new_profile_secret();
        let registration = registration_with_profiles(vec![AccountProfile {
            name: "old".into(),
            secret: secret.clone(),
            restrictions: Some(ProfileRestrictions {
                allowed_kinds: vec![],
                expires_at: 1,
            }),
        }]);
        store.put_association("client", &registration.pubkey, &secret);

        assert!(!authorize(&store, &registration, &kind_event(1), "client"));
    }

    #[test]
    fn future_expiry_also_bounds_the_event_timestamp() {
        let store = Store::in_memory();
        let secret = new_profile_secret();
        let horizon = now() + 3600;
        let registration = registration_with_profiles(vec![AccountProfile {
            name: "shortlived".into(),
            secret: secret.clone(),
            restrictions: Some(ProfileRestrictions {
                allowed_kinds: vec![],
                expires_at: horizon,
            }),
        }]);
        store.put_association("client", &registration.pubkey, &secret);

        assert!(authorize(&store, &registration, &kind_event(1), "client"));

        let mut postdated = kind_event(1);
        postdated.created_at = horizon + 1;
        assert!(!authorize(&store, &registration, &postdated, "client"));
    }

    #[test]
    fn wrong_or_missing_secret_fails() {
        let store = Store::in_memory();
        let registration = registration_with_profiles(vec![AccountProfile {
            name: PROFILE_ROOT.into(),
            secret: new_profile_secret(),
            restrictions: None,
        }]);

        // nothing associated
        assert!(!authorize(&store, &registration, &kind_event(1), "client"));

        // wrong secret associated
        store.put_association("client", &registration.pubkey, "not-the-secret");
        assert!(!authorize(&store, &registration, &kind_event(1), "client"));
    }

    #[test]
    fn bunker_challenge_auth_is_refused() {
        let store = Store::in_memory();
        let secret = new_profile_secret();
        let registration = registration_with_profiles(vec![AccountProfile {
            name: PROFILE_ROOT.into(),
            secret: secret.clone(),
            restrictions: None,
        }]);
        store.put_association("client", &registration.pubkey, &secret);

        let auth = Event::new(
            KIND_CLIENT_AUTH,
            "",
            vec![vec!["challenge".into(), "frostbunker:abc".into()]],
        );
        assert!(!authorize(&store, &registration, &auth, "client"));

        let benign = Event::new(
            KIND_CLIENT_AUTH,
            "",
            vec![vec!["challenge".into(), "ordinary".into()]],
        );
        assert!(authorize(&store, &registration, &benign, "client"));
    }
}
