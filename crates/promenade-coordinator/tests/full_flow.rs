//! End-to-end flows through a real coordinator: dealer → signers →
//! registration → NIP-46 client → threshold signature. Transport is the
//! in-memory relay plus the coordinator's in-process client, so every
//! policy path is the production one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use promenade_cli::{create, CreateOptions};
use promenade_common::kinds::{
    KIND_CONFIGURATION, KIND_EVENT_TO_BE_SIGNED, KIND_GROUP_COMMIT, KIND_NOSTR_CONNECT,
};
use promenade_common::{
    crypto, new_profile_secret, AccountProfile, AccountRegistration, Event, Filter, Keys,
    MemoryRelay, RegisteredSigner, Relay, RelayInfo, PROFILE_ROOT,
};
use promenade_coordinator::nip46::{handle_request, Request, Response};
use promenade_coordinator::{Coordinator, GroupContext, LocalClient, Store};
use promenade_frost::{trusted_deal, Configuration};
use promenade_signer::{run_acceptor, run_signer, AcceptorConfig, ShardStore};

const COORDINATOR_URL: &str = "ws://coordinator.test";
const INDEX_RELAY: &str = "ws://index.test";
const ACK_RELAY: &str = "ws://acks.test";

/// Routes the coordinator URL to the in-process client and everything
/// else to the shared memory relay.
struct Router {
    routes: HashMap<String, Arc<dyn Relay>>,
    fallback: Arc<MemoryRelay>,
}

impl Router {
    fn for_party(coordinator: &Arc<Coordinator>, memory: &Arc<MemoryRelay>, keys: Keys) -> Arc<Self> {
        let mut routes: HashMap<String, Arc<dyn Relay>> = HashMap::new();
        routes.insert(
            COORDINATOR_URL.to_string(),
            Arc::new(LocalClient::new(coordinator.clone(), keys, "127.0.0.1")),
        );
        Arc::new(Router {
            routes,
            fallback: memory.clone(),
        })
    }

    fn route(&self, url: &str) -> &dyn Relay {
        self.routes
            .get(url)
            .map(|relay| relay.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }
}

#[async_trait]
impl Relay for Router {
    async fn publish(&self, url: &str, event: Event) -> promenade_common::Result<()> {
        self.route(url).publish(url, event).await
    }

    async fn subscribe(
        &self,
        url: &str,
        filter: Filter,
    ) -> promenade_common::Result<mpsc::Receiver<Event>> {
        self.route(url).subscribe(url, filter).await
    }

    async fn fetch(&self, url: &str, filter: Filter) -> promenade_common::Result<Vec<Event>> {
        self.route(url).fetch(url, filter).await
    }

    async fn info(&self, url: &str) -> promenade_common::Result<RelayInfo> {
        self.route(url).info(url).await
    }
}

fn test_coordinator() -> Arc<Coordinator> {
    Coordinator::new(
        Keys::generate(),
        COORDINATOR_URL.to_string(),
        Store::in_memory(),
    )
}

async fn rpc_roundtrip(
    coordinator: &Arc<Coordinator>,
    client: &Keys,
    handler_pubkey: &str,
    request: &Request,
) -> Response {
    let payload = serde_json::to_string(request).unwrap();
    let mut event = Event::new(
        KIND_NOSTR_CONNECT,
        crypto::encrypt(client, handler_pubkey, &payload).unwrap(),
        vec![vec!["p".into(), handler_pubkey.to_string()]],
    );
    event.sign(client).unwrap();

    let reply = handle_request(coordinator, &event).await.unwrap();
    let handler_registration = coordinator
        .store
        .registration_by_handler(handler_pubkey)
        .unwrap();
    let plaintext = crypto::decrypt(
        &handler_registration.handler_secret,
        &client.public_key(),
        &reply.content,
    )
    .unwrap();
    serde_json::from_str(&plaintext).unwrap()
}

/// Dealer splits a key to three live signer daemons, a NIP-46 client
/// connects with the root secret, and a kind-1 note comes back with a
/// valid group signature.
#[tokio::test(flavor = "multi_thread")]
async fn full_bunker_flow() {
    let memory = Arc::new(MemoryRelay::new());
    let coordinator = test_coordinator();

    // three signer daemons, each with its own inbox relay
    let mut signer_pubkeys = Vec::new();
    for i in 0..3 {
        let keys = Keys::generate();
        signer_pubkeys.push(keys.public_key());
        let store = Arc::new(ShardStore::in_memory(&keys));
        let relay: Arc<dyn Relay> = Router::for_party(&coordinator, &memory, keys);

        let (restart_tx, restart_rx) = watch::channel(0u64);
        let config = AcceptorConfig {
            accept_relays: vec![format!("ws://inbox-{i}.test")],
            index_relays: vec![INDEX_RELAY.to_string()],
            min_pow: 4,
            accept_max: None,
        };
        tokio::spawn(run_acceptor(relay.clone(), store.clone(), config, restart_tx));
        tokio::spawn(run_signer(relay, store, restart_rx));
    }

    // let the acceptors publish their relay lists and start listening
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the user deals 2-of-3
    let user = Keys::generate();
    let dealer_relay: Arc<dyn Relay> =
        Router::for_party(&coordinator, &memory, user.clone());
    let mut options = CreateOptions::new(
        &user.secret_hex(),
        COORDINATOR_URL,
        signer_pubkeys.clone(),
        2,
    );
    options.index_relays = vec![INDEX_RELAY.to_string()];
    options.ack_read_relays = vec![ACK_RELAY.to_string()];
    options.pow_target = 4;
    options.ack_timeout = Duration::from_secs(20);

    let bunker = create(dealer_relay, options).await.unwrap();
    assert!(bunker.starts_with("bunker://"));
    let handler_pubkey = bunker
        .strip_prefix("bunker://")
        .unwrap()
        .split('?')
        .next()
        .unwrap()
        .to_string();
    let root_secret = bunker.split("secret=").nth(1).unwrap().to_string();

    // wait for the signers to finish the handshake and come online
    for _ in 0..100 {
        if coordinator.online_signers.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(coordinator.online_signers.len(), 3);

    let client = Keys::generate();

    let connect = rpc_roundtrip(
        &coordinator,
        &client,
        &handler_pubkey,
        &Request {
            id: "c1".into(),
            method: "connect".into(),
            params: vec![handler_pubkey.clone(), root_secret],
        },
    )
    .await;
    assert_eq!(connect.result, "ack");

    let pubkey = rpc_roundtrip(
        &coordinator,
        &client,
        &handler_pubkey,
        &Request {
            id: "c2".into(),
            method: "get_public_key".into(),
            params: vec![],
        },
    )
    .await;
    assert_eq!(pubkey.result, user.public_key());

    let note = Event::new(1, "hello from the conglomerate", vec![]);
    let signed = rpc_roundtrip(
        &coordinator,
        &client,
        &handler_pubkey,
        &Request {
            id: "c3".into(),
            method: "sign_event".into(),
            params: vec![serde_json::to_string(&note).unwrap()],
        },
    )
    .await;
    assert!(signed.error.is_empty(), "sign failed: {}", signed.error);

    let signed_note: Event = serde_json::from_str(&signed.result).unwrap();
    assert_eq!(signed_note.kind, 1);
    assert_eq!(signed_note.pubkey, user.public_key());
    assert!(signed_note.verify(), "aggregate signature must verify");

    // the session is retained and marked done
    assert!(coordinator
        .sessions
        .iter()
        .any(|session| session.status_string() == "done"));
}

/// Registers a group directly with the coordinator; helper for the
/// session-level scenarios below.
fn register_group(
    coordinator: &Arc<Coordinator>,
    user: &Keys,
    signer_keys: &[Keys],
    threshold: u16,
) -> (AccountRegistration, Vec<promenade_frost::KeyShard>) {
    let (shards, _, _) =
        trusted_deal(user.secret_scalar(), threshold, signer_keys.len() as u16).unwrap();
    let registration = AccountRegistration {
        pubkey: user.public_key(),
        handler_secret: Keys::generate(),
        threshold,
        signers: signer_keys
            .iter()
            .zip(&shards)
            .map(|(keys, shard)| RegisteredSigner {
                peer_pubkey: keys.public_key(),
                shard: shard.public.clone(),
            })
            .collect(),
        profiles: vec![AccountProfile {
            name: PROFILE_ROOT.into(),
            secret: new_profile_secret(),
            restrictions: None,
        }],
    };
    let mut event = registration.encode();
    event.sign(user).unwrap();
    let decoded = AccountRegistration::decode(&event).unwrap();
    coordinator.store.put_registration(event, decoded.clone());
    (decoded, shards)
}

/// Opens the signing-flow subscription for one signer, marking it
/// online, and returns the event stream.
async fn go_online(
    coordinator: &Arc<Coordinator>,
    keys: &Keys,
) -> (Arc<LocalClient>, mpsc::Receiver<Event>) {
    let client = Arc::new(LocalClient::new(
        coordinator.clone(),
        keys.clone(),
        "10.1.1.1",
    ));
    let receiver = client
        .subscribe(
            COORDINATOR_URL,
            Filter {
                kinds: vec![KIND_CONFIGURATION, KIND_GROUP_COMMIT, KIND_EVENT_TO_BE_SIGNED],
                p_tags: vec![keys.public_key()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    (client, receiver)
}

/// Too few online signers fails fast with the exact capacity error.
#[tokio::test(flavor = "multi_thread")]
async fn not_enough_online_signers() {
    let coordinator = test_coordinator();
    let user = Keys::generate();
    let signer_keys: Vec<Keys> = (0..4).map(|_| Keys::generate()).collect();
    let (registration, _) = register_group(&coordinator, &user, &signer_keys, 3);

    // only two of four signers are listening
    let (_c1, _r1) = go_online(&coordinator, &signer_keys[0]).await;
    let (_c2, _r2) = go_online(&coordinator, &signer_keys[1]).await;

    let context = GroupContext::new(registration);
    let mut note = Event::new(1, "will not happen", vec![]);
    let error = context
        .sign_event(&coordinator, &mut note, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "not enough signers online: have 2, needed 3"
    );
}

/// With five registered signers and only {2nd, 4th, 5th} online, the
/// configuration picks exactly those, in declared order.
#[tokio::test(flavor = "multi_thread")]
async fn selection_follows_declared_order() {
    let coordinator = test_coordinator();
    let user = Keys::generate();
    let signer_keys: Vec<Keys> = (0..5).map(|_| Keys::generate()).collect();
    let (registration, _) = register_group(&coordinator, &user, &signer_keys, 3);

    let (_cb, mut rx_b) = go_online(&coordinator, &signer_keys[1]).await;
    let (_cd, _rx_d) = go_online(&coordinator, &signer_keys[3]).await;
    let (_ce, _rx_e) = go_online(&coordinator, &signer_keys[4]).await;

    let context = GroupContext::new(registration);
    let mut note = Event::new(1, "selection probe", vec![]);
    let coordinator_clone = coordinator.clone();
    let handle = tokio::spawn(async move {
        // nobody answers, so this times out; we only want the broadcast
        let _ = context
            .sign_event(&coordinator_clone, &mut note, Duration::from_secs(1))
            .await;
    });

    let configuration_event =
        tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(configuration_event.kind, KIND_CONFIGURATION);
    let configuration = Configuration::decode_hex(&configuration_event.content).unwrap();
    assert_eq!(configuration.participants, vec![2, 4, 5]);
    assert_eq!(configuration.threshold, 3);
    assert_eq!(configuration.max_signers, 5);

    handle.await.unwrap();
}

/// A signer returning a corrupted partial signature is identified by id
/// and the session records the participant error.
#[tokio::test(flavor = "multi_thread")]
async fn tampered_partial_signature_names_the_culprit() {
    let coordinator = test_coordinator();
    let user = Keys::generate();
    let signer_keys: Vec<Keys> = (0..3).map(|_| Keys::generate()).collect();
    let (registration, shards) = register_group(&coordinator, &user, &signer_keys, 3);

    // three hand-driven signers; the second one flips a bit in its share
    for (index, keys) in signer_keys.iter().enumerate() {
        let (client, mut receiver) = go_online(&coordinator, keys).await;
        let shard = shards[index].clone();
        let keys = keys.clone();
        let tamper = index == 1;
        tokio::spawn(async move {
            let mut signer: Option<promenade_frost::Signer> = None;
            let mut session_id = String::new();
            let mut group_pubkey = String::new();
            let mut message: Option<[u8; 32]> = None;
            let mut binonce: Option<promenade_frost::BinoncePublic> = None;
            while let Some(event) = receiver.recv().await {
                match event.kind {
                    KIND_CONFIGURATION => {
                        let configuration =
                            Configuration::decode_hex(&event.content).unwrap();
                        group_pubkey = hex::encode(promenade_frost::curve::xonly(
                            &configuration.public_key,
                        ));
                        session_id = event.id.clone();
                        let mut s =
                            promenade_frost::Signer::new(configuration, shard.clone()).unwrap();
                        let commitment = s.commit(&session_id);
                        signer = Some(s);
                        let mut commit_event = Event::new(
                            promenade_common::kinds::KIND_COMMIT,
                            commitment.hex(),
                            vec![
                                vec!["e".into(), session_id.clone()],
                                vec!["p".into(), group_pubkey.clone()],
                            ],
                        );
                        commit_event.sign(&keys).unwrap();
                        client
                            .publish(COORDINATOR_URL, commit_event)
                            .await
                            .unwrap();
                    }
                    KIND_EVENT_TO_BE_SIGNED => {
                        let to_sign: Event = serde_json::from_str(&event.content).unwrap();
                        message = Some(to_sign.id_bytes().unwrap());
                    }
                    KIND_GROUP_COMMIT => {
                        binonce =
                            Some(promenade_frost::BinoncePublic::decode_hex(&event.content)
                                .unwrap());
                    }
                    _ => {}
                }
                if let (Some(msg), Some(bn)) = (&message, &binonce) {
                    let mut partial = signer
                        .as_mut()
                        .unwrap()
                        .sign(&session_id, msg, bn)
                        .unwrap();
                    if tamper {
                        partial.value += k256::Scalar::ONE;
                    }
                    let mut partial_event = Event::new(
                        promenade_common::kinds::KIND_PARTIAL_SIGNATURE,
                        partial.hex(),
                        vec![
                            vec!["e".into(), session_id.clone()],
                            vec!["p".into(), group_pubkey.clone()],
                        ],
                    );
                    partial_event.sign(&keys).unwrap();
                    client
                        .publish(COORDINATOR_URL, partial_event)
                        .await
                        .unwrap();
                    return;
                }
            }
        });
    }

    let culprit_id = registration.signers[1].shard.id;
    let context = GroupContext::new(registration);
    let mut note = Event::new(1, "sabotage", vec![]);
    let error = context
        .sign_event(&coordinator, &mut note, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        format!("participant {culprit_id} failed: invalid signature share")
    );

    assert!(coordinator.sessions.iter().any(|session| {
        session.status_string()
            == format!("error:participant {culprit_id} failed: invalid signature share")
    }));
}
