//! The dealer pipeline: split a master key, hand one shard to each
//! signer, wait for every signer's acknowledgement, then register the
//! group with the chosen coordinator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use promenade_common::kinds::{KIND_RELAY_LIST, KIND_SHARD, KIND_SHARD_ACK};
use promenade_common::{
    bunker_url, crypto, new_profile_secret, pow, AccountProfile, AccountRegistration, Event,
    Filter, Keys, RegisteredSigner, Relay, PROFILE_ROOT,
};
use promenade_frost::trusted_deal;
use promenade_frost::curve::xonly;

/// Fallback relays the dealer also listens on for signer acks; each
/// shard event names them in its `reply` tag.
pub const ACK_READ_RELAYS: &[&str] = &[
    "wss://relay.primal.net",
    "wss://pyramid.fiatjaf.com",
    "wss://relay.damus.io",
    "wss://nostr-pub.wellorder.net",
];

/// Proof-of-work the dealer mines onto each shard event.
pub const SHARD_POW_TARGET: u32 = 22;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// The master secret to be split, hex.
    pub secret_hex: String,
    /// Relay chosen to act as coordinator.
    pub coordinator: String,
    /// Permanent pubkeys of the chosen signers, in order; shard ids are
    /// assigned 1..=n along this order.
    pub signer_pubkeys: Vec<String>,
    pub threshold: u16,
    /// Indexer relays for 10002 lookups.
    pub index_relays: Vec<String>,
    /// Extra relays to watch for acks (and advertise in `reply` tags).
    pub ack_read_relays: Vec<String>,
    pub pow_target: u32,
    /// How long to wait for all signer acks.
    pub ack_timeout: Duration,
}

impl CreateOptions {
    pub fn new(
        secret_hex: &str,
        coordinator: &str,
        signer_pubkeys: Vec<String>,
        threshold: u16,
    ) -> Self {
        CreateOptions {
            secret_hex: secret_hex.to_string(),
            coordinator: coordinator.to_string(),
            signer_pubkeys,
            threshold,
            index_relays: promenade_common::INDEX_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ack_read_relays: ACK_READ_RELAYS.iter().map(|s| s.to_string()).collect(),
            pow_target: SHARD_POW_TARGET,
            ack_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Run the full account-creation pipeline and return the bunker URL.
pub async fn create(relay: Arc<dyn Relay>, options: CreateOptions) -> anyhow::Result<String> {
    info!("preparing stuff");
    if options.threshold == 0 || options.threshold as usize > options.signer_pubkeys.len() {
        anyhow::bail!("invalid threshold");
    }
    if !options.coordinator.starts_with("ws://") && !options.coordinator.starts_with("wss://") {
        anyhow::bail!("coordinator URL '{}' is invalid", options.coordinator);
    }
    for pubkey in &options.signer_pubkeys {
        if hex::decode(pubkey).map(|b| b.len()).unwrap_or(0) != 32 {
            anyhow::bail!("invalid pubkey '{pubkey}'");
        }
    }

    let keys = Keys::parse(&options.secret_hex).map_err(|_| anyhow::anyhow!("invalid sec"))?;

    info!("grabbing their inbox relays");
    let mut inboxes: HashMap<String, Vec<String>> = HashMap::new();
    for index_relay in &options.index_relays {
        let mut filter = Filter::kinds(vec![KIND_RELAY_LIST]);
        filter.authors = options.signer_pubkeys.clone();
        filter.authors.push(keys.public_key());
        let Ok(events) = relay.fetch(index_relay, filter).await else {
            continue;
        };
        for event in events {
            let inbox = inboxes.entry(event.pubkey.clone()).or_default();
            for tag in event.tags_named("r") {
                if tag.len() == 2 || tag.get(2).map(|m| m == "read").unwrap_or(false) {
                    if let Some(url) = tag.get(1) {
                        if !inbox.contains(url) {
                            inbox.push(url.clone());
                        }
                    }
                }
            }
        }
    }

    info!("sharding key");
    let (shards, aggregate, _) = trusted_deal(
        keys.secret_scalar(),
        options.threshold,
        options.signer_pubkeys.len() as u16,
    )?;
    if hex::encode(xonly(&aggregate)) != keys.public_key() {
        anyhow::bail!("the split went wrong");
    }

    let mut registration = AccountRegistration {
        pubkey: keys.public_key(),
        handler_secret: Keys::generate(),
        threshold: options.threshold,
        signers: Vec::with_capacity(options.signer_pubkeys.len()),
        profiles: Vec::new(),
    };

    // listen for acks before sending anything out
    info!("listening for responses");
    let our_read_relays = inboxes.get(&keys.public_key()).cloned().unwrap_or_default();
    if our_read_relays.is_empty() && options.ack_read_relays.is_empty() {
        anyhow::bail!("we need some read relays first");
    }
    let mut ack_relays = our_read_relays;
    for url in &options.ack_read_relays {
        if !ack_relays.contains(url) {
            ack_relays.push(url.clone());
        }
    }
    let (ack_tx, mut acks) = tokio::sync::mpsc::channel::<Event>(64);
    for url in &ack_relays {
        let filter = Filter::kinds(vec![KIND_SHARD_ACK]).with_p_tag(keys.public_key());
        match relay.subscribe(url, filter).await {
            Ok(mut receiver) => {
                let ack_tx = ack_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = receiver.recv().await {
                        if ack_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                });
            }
            Err(e) => warn!(url = %url, error = %e, "can't listen for acks"),
        }
    }

    // one shard to each signer
    let mut sent_shard_ids: HashSet<String> = HashSet::new();
    for (index, signer_pubkey) in options.signer_pubkeys.iter().enumerate() {
        info!(signer = %signer_pubkey, "sending shard");
        let shard = &shards[index];
        registration.signers.push(RegisteredSigner {
            peer_pubkey: signer_pubkey.clone(),
            shard: shard.public.clone(),
        });

        let signer_inbox = inboxes.get(signer_pubkey).cloned().unwrap_or_default();
        if signer_inbox.is_empty() {
            anyhow::bail!("signer {signer_pubkey} doesn't have inbox relays");
        }

        let ciphertext = crypto::encrypt(&keys, signer_pubkey, &shard.hex())
            .map_err(|e| anyhow::anyhow!("failed to encrypt to {signer_pubkey}: {e}"))?;
        let mut reply_tag = vec!["reply".to_string()];
        reply_tag.extend(options.ack_read_relays.iter().cloned());
        let mut shard_event = Event::new(
            KIND_SHARD,
            ciphertext,
            vec![
                vec!["p".into(), signer_pubkey.clone()],
                vec!["coordinator".into(), options.coordinator.clone()],
                reply_tag,
            ],
        );
        shard_event.pubkey = keys.public_key();

        info!("doing work");
        pow::mine(&mut shard_event, options.pow_target);
        shard_event.sign(&keys)?;
        sent_shard_ids.insert(shard_event.id.clone());

        // publish everywhere at once; one acceptance is enough
        let mut publishes = Vec::new();
        for url in &signer_inbox {
            let relay = relay.clone();
            let url = url.clone();
            let event = shard_event.clone();
            publishes.push(tokio::spawn(
                async move { relay.publish(&url, event).await },
            ));
        }
        let mut delivered = false;
        let mut errors = Vec::new();
        for publish in publishes {
            match publish.await {
                Ok(Ok(())) => delivered = true,
                Ok(Err(e)) => errors.push(e.to_string()),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if !delivered {
            anyhow::bail!("failed to send shard to {signer_pubkey}: {errors:?}");
        }
    }

    // in the meantime create the root profile
    registration.profiles.push(AccountProfile {
        name: PROFILE_ROOT.into(),
        secret: new_profile_secret(),
        restrictions: None,
    });

    info!("waiting for acks from all signers");
    let mut acked: HashSet<String> = HashSet::new();
    let deadline = tokio::time::Instant::now() + options.ack_timeout;
    while acked.len() < options.signer_pubkeys.len() {
        let event = tokio::time::timeout_at(deadline, acks.recv())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "timed out waiting for acks, got {} of {}",
                    acked.len(),
                    options.signer_pubkeys.len()
                )
            })?
            .ok_or_else(|| anyhow::anyhow!("ack stream ended early"))?;

        let Some(reference) = event.tag_value("e") else { continue };
        if !sent_shard_ids.contains(reference) {
            continue;
        }
        if !options.signer_pubkeys.contains(&event.pubkey) || !event.verify() {
            continue;
        }
        if acked.insert(event.pubkey.clone()) {
            info!(signer = %event.pubkey, "ack received");
        }
    }

    info!(coordinator = %options.coordinator, "registering on coordinator");
    let mut registration_event = registration.encode();
    registration_event.sign(&keys)?;
    relay
        .publish(&options.coordinator, registration_event)
        .await
        .map_err(|e| anyhow::anyhow!("failed to notify the coordinator: {e}"))?;
    info!("done");

    Ok(bunker_url(
        &registration.handler_pubkey(),
        &options.coordinator,
        &registration.profiles[0].secret,
    ))
}
