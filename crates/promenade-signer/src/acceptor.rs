//! Shard intake: the proof-of-work-gated handshake by which a user
//! deals a shard to this signer and the coordinator confirms the
//! registration before anything is persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use promenade_common::kinds::{KIND_RELAY_LIST, KIND_SHARD, KIND_SHARD_ACK};
use promenade_common::{crypto, now, pow, Event, Filter, Relay};
use promenade_frost::KeyShard;

use crate::error::SignerError;
use crate::store::{KeyGroup, ShardStore};

/// How long the whole user-and-coordinator handshake may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(6 * 60);

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Relays we listen on for incoming shards (our inbox).
    pub accept_relays: Vec<String>,
    /// Indexer relays for kind-10002 lookups.
    pub index_relays: Vec<String>,
    /// Minimum committed proof-of-work on shard events, 0..256.
    pub min_pow: u32,
    /// Stop accepting after this many new groups.
    pub accept_max: Option<u64>,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        AcceptorConfig {
            accept_relays: Vec::new(),
            index_relays: promenade_common::INDEX_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_pow: 20,
            accept_max: None,
        }
    }
}

/// Listen for shard deliveries and run the acceptance handshake for
/// each. Every accepted shard pokes `restart` so the signing loop picks
/// up the new group.
pub async fn run_acceptor(
    relay: Arc<dyn Relay>,
    store: Arc<ShardStore>,
    config: AcceptorConfig,
    restart: watch::Sender<u64>,
) -> Result<(), SignerError> {
    let keys = store.keys();
    let our_pubkey = keys.public_key();

    publish_relay_list(&relay, &store, &config).await;

    // merge the shard streams from every accept relay
    let (merged_tx, mut merged) = mpsc::channel::<Event>(64);
    for url in &config.accept_relays {
        let filter = Filter::kinds(vec![KIND_SHARD])
            .with_p_tag(our_pubkey.clone())
            .with_since(now());
        match relay.subscribe(url, filter).await {
            Ok(mut receiver) => {
                let merged_tx = merged_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = receiver.recv().await {
                        if merged_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                });
            }
            Err(e) => warn!(url = %url, error = %e, "can't listen for shards"),
        }
    }
    drop(merged_tx);

    info!(relays = ?config.accept_relays, "listening for new shards");
    let mut accepted: u64 = 0;
    while let Some(shard_event) = merged.recv().await {
        match accept_shard(&relay, &store, &config, &shard_event).await {
            Ok(group) => {
                info!(user = %group.aggregate_public_key, coordinator = %group.coordinator,
                      "shard accepted and stored");
                accepted += 1;
                let _ = restart.send(accepted);
                if Some(accepted) == config.accept_max {
                    info!(accepted, "reached max accepted groups, stopping acceptor");
                    return Ok(());
                }
            }
            Err(e) => warn!(from = %shard_event.pubkey, error = %e, "rejected shard"),
        }
    }
    Ok(())
}

/// Make sure our kind-10002 list points at the accept relays.
async fn publish_relay_list(
    relay: &Arc<dyn Relay>,
    store: &Arc<ShardStore>,
    config: &AcceptorConfig,
) {
    let keys = store.keys();
    let mut current: Vec<String> = Vec::new();
    for url in &config.index_relays {
        if let Ok(events) = relay
            .fetch(
                url,
                Filter::kinds(vec![KIND_RELAY_LIST]).with_author(keys.public_key()),
            )
            .await
        {
            for event in events {
                for tag in event.tags_named("r") {
                    if tag.len() == 2 || tag.get(2).map(|m| m == "read").unwrap_or(false) {
                        if let Some(value) = tag.get(1) {
                            current.push(value.clone());
                        }
                    }
                }
            }
        }
    }

    if current != config.accept_relays {
        let mut list = Event::new(
            KIND_RELAY_LIST,
            "",
            config
                .accept_relays
                .iter()
                .map(|url| vec!["r".to_string(), url.clone(), "read".to_string()])
                .collect(),
        );
        if list.sign(&keys).is_err() {
            return;
        }
        info!(relays = ?config.accept_relays, "updating our relay list");
        for url in &config.index_relays {
            let _ = relay.publish(url, list.clone()).await;
        }
    }
}

/// The acceptance handshake for one inbound shard event.
async fn accept_shard(
    relay: &Arc<dyn Relay>,
    store: &Arc<ShardStore>,
    config: &AcceptorConfig,
    shard_event: &Event,
) -> Result<KeyGroup, SignerError> {
    let keys = store.keys();

    // 1. proof-of-work gate
    let work = pow::committed_difficulty(shard_event);
    if work < config.min_pow {
        return Err(SignerError::Refused(format!(
            "not enough work: need {}, got {}",
            config.min_pow, work
        )));
    }
    if !shard_event.verify() {
        return Err(SignerError::Refused("broken shard event signature".into()));
    }

    // 2. decrypt and decode the shard
    let plaintext = crypto::decrypt(&keys, &shard_event.pubkey, &shard_event.content)?;
    let shard = KeyShard::decode_hex(&plaintext)?;
    shard.validate()?;

    // 3. locate and TOFU-pin the coordinator
    let coordinator_url = shard_event
        .tag_value("coordinator")
        .filter(|url| url.starts_with("ws://") || url.starts_with("wss://"))
        .ok_or_else(|| SignerError::Refused("broken coordinator url".into()))?
        .to_string();
    let coordinator_info = relay.info(&coordinator_url).await?;
    if hex::decode(&coordinator_info.pubkey).map(|b| b.len()).unwrap_or(0) != 32 {
        return Err(SignerError::Refused(format!(
            "coordinator has invalid pubkey '{}'",
            coordinator_info.pubkey
        )));
    }

    // 4. subscribe for the coordinator's registration ack before acking
    // the user, so the confirmation can't slip past us
    let mut coordinator_acks = relay
        .subscribe(
            &coordinator_url,
            Filter::kinds(vec![KIND_SHARD_ACK])
                .with_p_tag(keys.public_key())
                .with_cap_p_tag(shard_event.pubkey.clone()),
        )
        .await?;

    // 5. ack the user on their inbox relays plus any reply relays
    let mut reply_relays: Vec<String> = shard_event
        .find_tag("reply")
        .map(|tag| tag[1..].to_vec())
        .unwrap_or_default();
    for url in &config.index_relays {
        if let Ok(lists) = relay
            .fetch(
                url,
                Filter::kinds(vec![KIND_RELAY_LIST]).with_author(shard_event.pubkey.clone()),
            )
            .await
        {
            for list in lists {
                for tag in list.tags_named("r") {
                    if tag.len() == 2 || tag.get(2).map(|m| m == "read").unwrap_or(false) {
                        if let Some(value) = tag.get(1) {
                            reply_relays.push(value.clone());
                        }
                    }
                }
            }
        }
    }
    reply_relays.dedup();
    if reply_relays.is_empty() {
        return Err(SignerError::Refused("user has no inbox relays".into()));
    }

    let mut ack = Event::new(
        KIND_SHARD_ACK,
        "",
        vec![
            vec!["p".into(), shard_event.pubkey.clone()],
            vec!["e".into(), shard_event.id.clone()],
        ],
    );
    ack.sign(&keys)?;

    let mut delivered = false;
    for url in &reply_relays {
        match relay.publish(url, ack.clone()).await {
            Ok(()) => delivered = true,
            Err(e) => warn!(url = %url, error = %e, "couldn't deliver ack"),
        }
    }
    if !delivered {
        return Err(SignerError::Refused(format!(
            "failed to send ack back to {}",
            shard_event.pubkey
        )));
    }

    // 6. wait for the coordinator to confirm it stored the registration
    let confirmation = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(event) = coordinator_acks.recv().await {
            if event.kind == KIND_SHARD_ACK
                && event.pubkey == coordinator_info.pubkey
                && event.tag_value("P") == Some(shard_event.pubkey.as_str())
            {
                return Some(event);
            }
        }
        None
    })
    .await;
    match confirmation {
        Ok(Some(_)) => {}
        _ => {
            return Err(SignerError::Refused(
                "coordinator never confirmed the registration".into(),
            ))
        }
    }

    // 7. persist, replacing any previous shard for this group
    let group = KeyGroup {
        coordinator: coordinator_url,
        coordinator_pubkey: coordinator_info.pubkey,
        aggregate_public_key: shard_event.pubkey.clone(),
        encoded_secret_key_shard: plaintext,
    };
    store.replace_group(group.clone())?;
    Ok(group)
}
