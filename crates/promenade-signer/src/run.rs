//! The signing loop: one subscription per known coordinator, one task
//! per signing session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use promenade_common::kinds::{
    KIND_COMMIT, KIND_CONFIGURATION, KIND_EVENT_TO_BE_SIGNED, KIND_GROUP_COMMIT,
    KIND_PARTIAL_SIGNATURE,
};
use promenade_common::{Event, Filter, Keys, Relay};
use promenade_frost::curve::xonly;
use promenade_frost::{BinoncePublic, Configuration, KeyShard, Signer};

use crate::error::SignerError;
use crate::guard::refuse_reason;
use crate::store::ShardStore;

/// An in-flight session gets this long before the signer forgets it.
const SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Subscribe for signing rounds at every coordinator we hold shards for
/// and serve them until the process stops. A poke on `restart` (a new
/// accepted shard) tears the subscriptions down and rebuilds them.
pub async fn run_signer(
    relay: Arc<dyn Relay>,
    store: Arc<ShardStore>,
    mut restart: watch::Receiver<u64>,
) -> Result<(), SignerError> {
    loop {
        let keys = store.keys();
        let groups = store.key_groups();

        // one directed subscription per coordinator
        let mut by_coordinator: HashMap<String, String> = HashMap::new();
        for group in &groups {
            by_coordinator
                .entry(group.coordinator.clone())
                .or_insert_with(|| group.coordinator_pubkey.clone());
        }

        let (merged_tx, mut merged) = mpsc::channel::<(String, Event)>(64);
        let mut forwarders = Vec::new();
        for (url, coordinator_pubkey) in &by_coordinator {
            let filter = Filter {
                kinds: vec![KIND_CONFIGURATION, KIND_GROUP_COMMIT, KIND_EVENT_TO_BE_SIGNED],
                authors: vec![coordinator_pubkey.clone()],
                p_tags: vec![keys.public_key()],
                ..Default::default()
            };
            match relay.subscribe(url, filter).await {
                Ok(mut receiver) => {
                    let merged_tx = merged_tx.clone();
                    let url = url.clone();
                    forwarders.push(tokio::spawn(async move {
                        while let Some(event) = receiver.recv().await {
                            if merged_tx.send((url.clone(), event)).await.is_err() {
                                return;
                            }
                        }
                    }));
                }
                Err(e) => warn!(url = %url, error = %e, "can't subscribe at coordinator"),
            }
        }

        info!(groups = groups.len(), coordinators = by_coordinator.len(),
              "waiting for sign requests");

        let sessions: Arc<DashMap<String, mpsc::Sender<Event>>> = Arc::new(DashMap::new());
        let mut restart_open = true;
        loop {
            tokio::select! {
                changed = restart.changed(), if restart_open => {
                    match changed {
                        Ok(()) => {
                            info!("new shard accepted, restarting subscriptions");
                            break;
                        }
                        // acceptor gone for good; keep serving what we have
                        Err(_) => restart_open = false,
                    }
                }
                incoming = merged.recv() => {
                    let Some((coordinator_url, event)) = incoming else { return Ok(()) };
                    if !event.verify() {
                        continue;
                    }
                    dispatch(&relay, &store, &keys, &sessions, coordinator_url, event).await;
                }
            }
        }

        for forwarder in forwarders {
            forwarder.abort();
        }
    }
}

async fn dispatch(
    relay: &Arc<dyn Relay>,
    store: &Arc<ShardStore>,
    keys: &Keys,
    sessions: &Arc<DashMap<String, mpsc::Sender<Event>>>,
    coordinator_url: String,
    event: Event,
) {
    match event.kind {
        KIND_CONFIGURATION => {
            let session_id = event.id.clone();
            let (sender, receiver) = mpsc::channel(8);
            sessions.insert(session_id.clone(), sender.clone());

            let relay = relay.clone();
            let store = store.clone();
            let keys = keys.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let outcome = tokio::time::timeout(
                    SESSION_TIMEOUT,
                    run_session(&relay, &store, &keys, &coordinator_url, receiver),
                )
                .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(session = %session_id, error = %e, "session failed"),
                    Err(_) => warn!(session = %session_id, "session timed out"),
                }
                sessions.remove(&session_id);
            });

            let _ = sender.send(event).await;
        }
        KIND_GROUP_COMMIT | KIND_EVENT_TO_BE_SIGNED => {
            let Some(session_id) = event.tag_value("e") else { return };
            if let Some(sender) = sessions.get(session_id) {
                let _ = sender.try_send(event.clone());
            }
        }
        _ => {}
    }
}

/// One signing session, driven by the coordinator's three messages.
async fn run_session(
    relay: &Arc<dyn Relay>,
    store: &Arc<ShardStore>,
    keys: &Keys,
    coordinator_url: &str,
    mut receiver: mpsc::Receiver<Event>,
) -> Result<(), SignerError> {
    // round-opening statement
    let configuration_event = receiver
        .recv()
        .await
        .ok_or_else(|| SignerError::SessionAborted("no configuration".into()))?;
    let configuration = Configuration::decode_hex(&configuration_event.content)?;
    let session_id = configuration_event.id.clone();

    let group_pubkey = hex::encode(xonly(&configuration.public_key));
    let group = store
        .group_by_aggregate(&group_pubkey)
        .ok_or_else(|| SignerError::UnknownGroup(group_pubkey.clone()))?;
    let shard = KeyShard::decode_hex(&group.encoded_secret_key_shard)?;

    let mut signer = Signer::new(configuration, shard)?;
    info!(session = %session_id, user = %group_pubkey, "sign session started");

    // commit to this session's binonce
    let commitment = signer.commit(&session_id);
    let mut commit_event = Event::new(
        KIND_COMMIT,
        commitment.hex(),
        vec![
            vec!["e".into(), session_id.clone()],
            vec!["p".into(), group_pubkey.clone()],
        ],
    );
    commit_event.sign(keys)?;
    relay.publish(coordinator_url, commit_event).await?;

    // wait for the group binonce and the event to sign, in any order
    let mut message: Option<[u8; 32]> = None;
    let mut group_binonce: Option<BinoncePublic> = None;
    while message.is_none() || group_binonce.is_none() {
        let event = receiver
            .recv()
            .await
            .ok_or_else(|| SignerError::SessionAborted(session_id.clone()))?;
        match event.kind {
            KIND_EVENT_TO_BE_SIGNED => {
                let to_sign: Event = serde_json::from_str(&event.content)?;
                if !to_sign.check_id() {
                    return Err(SignerError::Refused(
                        "event to be signed has a broken id".into(),
                    ));
                }
                if let Some(reason) = refuse_reason(&to_sign, coordinator_url) {
                    return Err(SignerError::Refused(reason));
                }
                message = Some(to_sign.id_bytes()?);
            }
            KIND_GROUP_COMMIT => {
                group_binonce = Some(BinoncePublic::decode_hex(&event.content)?);
            }
            other => {
                warn!(kind = other, session = %session_id, "unexpected kind in session");
            }
        }
    }

    // partial signature out, session state gone
    let (Some(message), Some(group_binonce)) = (message, group_binonce) else {
        return Err(SignerError::SessionAborted(session_id));
    };
    let partial = signer.sign(&session_id, &message, &group_binonce)?;
    let mut partial_event = Event::new(
        KIND_PARTIAL_SIGNATURE,
        partial.hex(),
        vec![
            vec!["e".into(), session_id.clone()],
            vec!["p".into(), group_pubkey],
        ],
    );
    partial_event.sign(keys)?;
    relay.publish(coordinator_url, partial_event).await?;

    info!(session = %session_id, "signed");
    Ok(())
}
