//! Durable registration store plus the replaceable client-secret
//! associations. One JSON file per registration, replace-in-place,
//! 0600 permissions; a missing directory means memory-only (tests).

use std::path::PathBuf;

use dashmap::DashMap;
use tracing::warn;

use promenade_common::kinds::KIND_CLIENT_SECRET_ASSOCIATION;
use promenade_common::{AccountRegistration, Event, Filter};

use crate::error::CoordinatorError;

/// A stored registration: the raw signed event plus its decoded form.
#[derive(Debug, Clone)]
pub struct StoredRegistration {
    pub event: Event,
    pub registration: AccountRegistration,
}

#[derive(Default)]
pub struct Store {
    dir: Option<PathBuf>,
    /// Registrations by aggregate pubkey; replaced as a whole, never
    /// mutated.
    registrations: DashMap<String, StoredRegistration>,
    /// Latest client-secret association, keyed `client|group`. Modeled
    /// as an internal replaceable event of
    /// [`KIND_CLIENT_SECRET_ASSOCIATION`].
    associations: DashMap<String, Event>,
}

impl Store {
    /// Memory-only store.
    pub fn in_memory() -> Self {
        Store::default()
    }

    /// Open (creating if needed) a directory-backed store and load every
    /// registration in it.
    pub fn open(dir: PathBuf) -> Result<Self, CoordinatorError> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoordinatorError::Store(format!("create {}: {e}", dir.display())))?;

        let store = Store {
            dir: Some(dir.clone()),
            ..Store::default()
        };

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| CoordinatorError::Store(format!("read {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some("associations.json") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Event>(&data) else {
                warn!(path = %path.display(), "skipping unparseable registration file");
                continue;
            };
            match AccountRegistration::decode(&event) {
                Ok(registration) => {
                    store.registrations.insert(
                        registration.pubkey.clone(),
                        StoredRegistration {
                            event,
                            registration,
                        },
                    );
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid registration"),
            }
        }

        // associations live together in one file
        let associations_path = dir.join("associations.json");
        if let Ok(data) = std::fs::read_to_string(&associations_path) {
            if let Ok(map) = serde_json::from_str::<std::collections::HashMap<String, Event>>(&data)
            {
                for (key, event) in map {
                    store.associations.insert(key, event);
                }
            }
        }

        Ok(store)
    }

    fn write_file(&self, name: &str, contents: &str) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(name);
        if let Err(e) = std::fs::write(&path, contents) {
            warn!(path = %path.display(), error = %e, "failed to persist");
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
    }

    /// Store a decoded registration, replacing any previous one for the
    /// same aggregate pubkey.
    pub fn put_registration(&self, event: Event, registration: AccountRegistration) {
        if let Ok(json) = serde_json::to_string(&event) {
            self.write_file(&format!("{}.json", registration.pubkey), &json);
        }
        self.registrations.insert(
            registration.pubkey.clone(),
            StoredRegistration {
                event,
                registration,
            },
        );
    }

    pub fn registration_by_pubkey(&self, pubkey: &str) -> Option<AccountRegistration> {
        self.registrations
            .get(pubkey)
            .map(|stored| stored.registration.clone())
    }

    pub fn registration_by_handler(&self, handler_pubkey: &str) -> Option<AccountRegistration> {
        self.registrations
            .iter()
            .find(|stored| stored.registration.handler_pubkey() == handler_pubkey)
            .map(|stored| stored.registration.clone())
    }

    /// Whether this peer is a registered signer of any group here.
    pub fn is_registered_signer(&self, peer_pubkey: &str) -> bool {
        self.registrations
            .iter()
            .any(|stored| stored.registration.signer_by_peer(peer_pubkey).is_some())
    }

    /// Stored (persistent) events matching a filter; used to replay
    /// registration reads to their owner.
    pub fn events_matching(&self, filter: &Filter) -> Vec<Event> {
        self.registrations
            .iter()
            .map(|stored| stored.event.clone())
            .filter(|event| filter.matches(event))
            .collect()
    }

    /// Replace the secret associated with `(client, group)`.
    pub fn put_association(&self, client_pubkey: &str, group_pubkey: &str, secret: &str) {
        let mut record = Event::new(
            KIND_CLIENT_SECRET_ASSOCIATION,
            secret,
            vec![vec!["p".into(), group_pubkey.to_string()]],
        );
        record.pubkey = client_pubkey.to_string();
        record.id = record.compute_id();

        self.associations
            .insert(format!("{client_pubkey}|{group_pubkey}"), record);

        let snapshot: std::collections::HashMap<String, Event> = self
            .associations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if let Ok(json) = serde_json::to_string(&snapshot) {
            self.write_file("associations.json", &json);
        }
    }

    /// The latest secret a client presented for a group.
    pub fn association(&self, client_pubkey: &str, group_pubkey: &str) -> Option<String> {
        self.associations
            .get(&format!("{client_pubkey}|{group_pubkey}"))
            .map(|record| record.content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::Scalar;
    use promenade_common::{new_profile_secret, AccountProfile, Keys, RegisteredSigner, PROFILE_ROOT};
    use promenade_frost::trusted_deal;

    fn registration_event() -> (Event, AccountRegistration) {
        let (shards, _, _) = trusted_deal(&Scalar::from(7u64), 2, 3).unwrap();
        let registration = AccountRegistration {
            pubkey: "ab".repeat(32),
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
        };
        let event = registration.encode();
        (event, registration)
    }

    #[test]
    fn lookups_by_pubkey_handler_and_signer() {
        let store = Store::in_memory();
        let (event, registration) = registration_event();
        let handler = registration.handler_pubkey();
        let signer = registration.signers[0].peer_pubkey.clone();
        store.put_registration(event, registration.clone());

        assert!(store.registration_by_pubkey(&registration.pubkey).is_some());
        assert!(store.registration_by_handler(&handler).is_some());
        assert!(store.is_registered_signer(&signer));
        assert!(!store.is_registered_signer(&"cd".repeat(32)));
    }

    #[test]
    fn associations_are_replaceable() {
        let store = Store::in_memory();
        store.put_association("client", "group", "first");
        store.put_association("client", "group", "second");
        assert_eq!(store.association("client", "group"), Some("second".into()));
        assert_eq!(store.association("client", "other"), None);
    }

    #[test]
    fn registrations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (event, registration) = registration_event();
        let pubkey = registration.pubkey.clone();
        {
            let store = Store::open(dir.path().to_path_buf()).unwrap();
            store.put_registration(event, registration);
            store.put_association("client", &pubkey, "sekrit");
        }
        let reopened = Store::open(dir.path().to_path_buf()).unwrap();
        assert!(reopened.registration_by_pubkey(&pubkey).is_some());
        assert_eq!(
            reopened.association("client", &pubkey),
            Some("sekrit".into())
        );
    }
}
