//! Durable signer state: identity key plus one shard record per group,
//! kept in a single `data.json` with restrictive permissions.

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use promenade_common::Keys;

use crate::error::SignerError;

/// One accepted shard: where its coordinator lives, the coordinator key
/// pinned on first contact, and the shard itself (hex
/// [`promenade_frost::KeyShard`]) keyed by the group's aggregate pubkey.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyGroup {
    pub coordinator: String,
    pub coordinator_pubkey: String,
    pub aggregate_public_key: String,
    pub encoded_secret_key_shard: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SignerData {
    secret_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    key_groups: Vec<KeyGroup>,
}

/// The signer's durable store. Writers are serialized; group records are
/// replaced in place on re-registration of the same aggregate pubkey.
pub struct ShardStore {
    path: Option<PathBuf>,
    data: Mutex<SignerData>,
}

impl ShardStore {
    /// Open (or initialize, with a fresh identity key) the store in
    /// `dir`.
    pub fn open(dir: PathBuf) -> Result<Self, SignerError> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("data.json");

        let data = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
            _ => {
                let data = SignerData {
                    secret_key: Keys::generate().secret_hex(),
                    key_groups: Vec::new(),
                };
                write_data(&path, &data)?;
                data
            }
        };

        // make sure the stored key actually parses before going further
        Keys::parse(&data.secret_key)
            .map_err(|e| SignerError::Store(format!("bad stored secret key: {e}")))?;

        Ok(ShardStore {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// Memory-only store with a fixed identity, for tests.
    pub fn in_memory(keys: &Keys) -> Self {
        ShardStore {
            path: None,
            data: Mutex::new(SignerData {
                secret_key: keys.secret_hex(),
                key_groups: Vec::new(),
            }),
        }
    }

    /// The signer's permanent identity keypair.
    pub fn keys(&self) -> Keys {
        Keys::parse(&self.data.lock().secret_key).expect("validated at open")
    }

    pub fn key_groups(&self) -> Vec<KeyGroup> {
        self.data.lock().key_groups.clone()
    }

    pub fn group_by_aggregate(&self, aggregate_pubkey: &str) -> Option<KeyGroup> {
        self.data
            .lock()
            .key_groups
            .iter()
            .find(|group| group.aggregate_public_key == aggregate_pubkey)
            .cloned()
    }

    /// Store a group record, replacing any previous record for the same
    /// aggregate pubkey (re-registration semantics).
    pub fn replace_group(&self, group: KeyGroup) -> Result<(), SignerError> {
        let mut data = self.data.lock();
        data.key_groups
            .retain(|existing| existing.aggregate_public_key != group.aggregate_public_key);
        data.key_groups.push(group);
        if let Some(path) = &self.path {
            write_data(path, &data)?;
        }
        Ok(())
    }
}

fn write_data(path: &PathBuf, data: &SignerData) -> Result<(), SignerError> {
    let json = serde_json::to_string_pretty(data)?;
    std::fs::write(path, json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(aggregate: &str, shard: &str) -> KeyGroup {
        KeyGroup {
            coordinator: "ws://localhost:6363".into(),
            coordinator_pubkey: "cc".repeat(32),
            aggregate_public_key: aggregate.into(),
            encoded_secret_key_shard: shard.into(),
        }
    }

    #[test]
    fn initializes_with_a_fresh_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::open(dir.path().to_path_buf()).unwrap();
        let first = store.keys().public_key();

        let reopened = ShardStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.keys().public_key(), first);
    }

    #[test]
    fn replace_group_overwrites_same_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::open(dir.path().to_path_buf()).unwrap();

        store.replace_group(group("aaaa", "shard-one")).unwrap();
        store.replace_group(group("bbbb", "other")).unwrap();
        store.replace_group(group("aaaa", "shard-two")).unwrap();

        assert_eq!(store.key_groups().len(), 2);
        assert_eq!(
            store.group_by_aggregate("aaaa").unwrap().encoded_secret_key_shard,
            "shard-two"
        );
    }

    #[test]
    fn groups_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ShardStore::open(dir.path().to_path_buf()).unwrap();
            store.replace_group(group("aaaa", "shard")).unwrap();
        }
        let store = ShardStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.group_by_aggregate("aaaa").is_some());
    }
}
