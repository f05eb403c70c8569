//! The signing session: one linear task per `sign_event` request,
//! driving the three protocol rounds against the chosen signers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use promenade_common::kinds::{
    KIND_COMMIT, KIND_CONFIGURATION, KIND_EVENT_TO_BE_SIGNED, KIND_GROUP_COMMIT,
    KIND_PARTIAL_SIGNATURE,
};
use promenade_common::{AccountRegistration, Event, RegisteredSigner};
use promenade_frost::curve::lift_x;
use promenade_frost::{Commitment, Configuration, PartialSignature};

use crate::error::CoordinatorError;
use crate::relay::Coordinator;

/// How long a finished (or failed) session stays inspectable.
pub const SESSION_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Where a session currently is in the round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Initializing,
    Nonces,
    Prepare,
    Commit,
    Event,
    PartialSigs,
    Aggregating,
    Done,
    Error(String),
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Initializing => write!(f, "initializing"),
            SessionStatus::Nonces => write!(f, "nonces"),
            SessionStatus::Prepare => write!(f, "prepare"),
            SessionStatus::Commit => write!(f, "commit"),
            SessionStatus::Event => write!(f, "event"),
            SessionStatus::PartialSigs => write!(f, "partialsigs"),
            SessionStatus::Aggregating => write!(f, "aggregating"),
            SessionStatus::Done => write!(f, "done"),
            SessionStatus::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

/// In-memory handle for one signing attempt, keyed in the coordinator's
/// session map by the id of the round-opening Configuration event.
pub struct Session {
    /// The signers chosen for this round, by peer pubkey.
    pub chosen: HashMap<String, RegisteredSigner>,
    sender: mpsc::Sender<Event>,
    pub status: RwLock<SessionStatus>,
}

impl Session {
    /// Forward an inbound signer event into the session. Full channels
    /// drop the event; the state machine treats it as a straggler.
    pub fn deliver(&self, event: Event) {
        let _ = self.sender.try_send(event);
    }

    pub fn status_string(&self) -> String {
        self.status.read().to_string()
    }
}

/// Everything the coordinator knows about one registered group while
/// serving it.
pub struct GroupContext {
    pub registration: AccountRegistration,
}

impl GroupContext {
    pub fn new(registration: AccountRegistration) -> Self {
        GroupContext { registration }
    }

    pub fn aggregate_pubkey(&self) -> &str {
        &self.registration.pubkey
    }

    /// Run a full signing round for `event`, filling in its author, id
    /// and signature on success. The deadline covers every wait.
    pub async fn sign_event(
        &self,
        coordinator: &Arc<Coordinator>,
        event: &mut Event,
        timeout: Duration,
    ) -> Result<(), CoordinatorError> {
        let deadline = Instant::now() + timeout;

        // pick the first `threshold` online signers in declared order
        let threshold = self.registration.threshold;
        let mut chosen: HashMap<String, RegisteredSigner> = HashMap::new();
        let mut participants = Vec::with_capacity(threshold as usize);
        for signer in &self.registration.signers {
            if chosen.len() < threshold as usize
                && coordinator.signer_is_online(&signer.peer_pubkey)
            {
                participants.push(signer.shard.id);
                chosen.insert(signer.peer_pubkey.clone(), signer.clone());
            }
        }
        if chosen.len() < threshold as usize {
            return Err(CoordinatorError::NotEnoughSigners {
                have: chosen.len(),
                needed: threshold as usize,
            });
        }

        let configuration = Configuration {
            threshold,
            max_signers: self.registration.signers.len() as u16,
            public_key: lift_x(&decode_pubkey(&self.registration.pubkey)?)?,
            participants,
        };

        // round-opening statement; its id names the session
        let mut configuration_event = Event::new(
            KIND_CONFIGURATION,
            configuration.hex(),
            chosen
                .keys()
                .map(|peer| vec!["p".to_string(), peer.clone()])
                .collect(),
        );
        configuration_event.sign(&coordinator.keys)?;
        let session_id = configuration_event.id.clone();

        let (sender, receiver) = mpsc::channel(threshold as usize);
        let session = Arc::new(Session {
            chosen: chosen.clone(),
            sender,
            status: RwLock::new(SessionStatus::Initializing),
        });
        coordinator
            .sessions
            .insert(session_id.clone(), session.clone());

        info!(session = %session_id, user = %self.registration.pubkey,
              signers = chosen.len(), "starting signing session");

        let result = self
            .run_rounds(
                coordinator,
                &session,
                &session_id,
                &configuration,
                configuration_event,
                receiver,
                event,
                deadline,
            )
            .await;

        match &result {
            Ok(()) => *session.status.write() = SessionStatus::Done,
            Err(e) => *session.status.write() = SessionStatus::Error(e.to_string()),
        }

        // keep the session around for inspection, then delete it
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SESSION_RETENTION).await;
            coordinator.sessions.remove(&session_id);
        });

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_rounds(
        &self,
        coordinator: &Arc<Coordinator>,
        session: &Arc<Session>,
        session_id: &str,
        configuration: &Configuration,
        configuration_event: Event,
        mut receiver: mpsc::Receiver<Event>,
        event: &mut Event,
        deadline: Instant,
    ) -> Result<(), CoordinatorError> {
        let chosen = &session.chosen;
        coordinator.broadcast(configuration_event).await;

        // round 1: collect binonce commitments
        *session.status.write() = SessionStatus::Nonces;
        let mut commitments: HashMap<String, Commitment> = HashMap::new();
        while commitments.len() < chosen.len() {
            let incoming = recv_or_deadline(&mut receiver, deadline)
                .await
                .map_err(|_| {
                    CoordinatorError::MissingCommits(missing(chosen, &commitments))
                })??;
            if incoming.kind != KIND_COMMIT {
                return Err(CoordinatorError::WrongKind {
                    got: incoming.kind,
                    expected: KIND_COMMIT,
                    from: incoming.pubkey,
                });
            }
            if commitments.contains_key(&incoming.pubkey) {
                continue;
            }
            let commitment = Commitment::decode_hex(&incoming.content)
                .map_err(|e| CoordinatorError::CommitDecode(e.to_string()))?;
            commitments.insert(incoming.pubkey, commitment);
        }

        // prepare the event to be signed so we have the message hash
        *session.status.write() = SessionStatus::Prepare;
        event.pubkey = self.registration.pubkey.clone();
        event.sig = String::new();
        event.id = event.compute_id();
        let message = event.id_bytes()?;

        // aggregate nonces, binding coefficient, final nonce
        *session.status.write() = SessionStatus::Commit;
        let commitment_list: Vec<Commitment> = commitments.values().copied().collect();
        let group = configuration.group_commitment(&commitment_list, &message)?;

        let signer_tags = |session_id: &str| -> Vec<Vec<String>> {
            let mut tags = Vec::with_capacity(1 + chosen.len());
            tags.push(vec!["e".to_string(), session_id.to_string()]);
            tags.extend(
                chosen
                    .keys()
                    .map(|peer| vec!["p".to_string(), peer.clone()]),
            );
            tags
        };

        // round 2: group binonce out, then the event to be signed
        let mut group_commit_event = Event::new(
            KIND_GROUP_COMMIT,
            group.binonce.hex(),
            signer_tags(session_id),
        );
        group_commit_event.sign(&coordinator.keys)?;
        coordinator.broadcast(group_commit_event).await;

        *session.status.write() = SessionStatus::Event;
        let mut event_to_sign = Event::new(
            KIND_EVENT_TO_BE_SIGNED,
            serde_json::to_string(event).map_err(promenade_common::CommonError::Json)?,
            signer_tags(session_id),
        );
        event_to_sign.sign(&coordinator.keys)?;
        coordinator.broadcast(event_to_sign).await;

        // round 3: collect and verify partial signatures
        *session.status.write() = SessionStatus::PartialSigs;
        let mut partials: Vec<PartialSignature> = Vec::with_capacity(chosen.len());
        let mut seen: Vec<String> = Vec::with_capacity(chosen.len());
        while partials.len() < chosen.len() {
            let incoming = recv_or_deadline(&mut receiver, deadline)
                .await
                .map_err(|_| {
                    let done: HashMap<String, ()> =
                        seen.iter().map(|k| (k.clone(), ())).collect();
                    CoordinatorError::MissingPartials(missing(chosen, &done))
                })??;
            if incoming.kind != KIND_PARTIAL_SIGNATURE {
                return Err(CoordinatorError::WrongKind {
                    got: incoming.kind,
                    expected: KIND_PARTIAL_SIGNATURE,
                    from: incoming.pubkey,
                });
            }
            if seen.contains(&incoming.pubkey) {
                continue;
            }
            let partial = PartialSignature::decode_hex(&incoming.content)
                .map_err(|_| CoordinatorError::PartialDecode(incoming.pubkey.clone()))?;

            let signer = &chosen[&incoming.pubkey];
            let commitment = &commitments[&incoming.pubkey];
            configuration
                .verify_partial_signature(
                    &signer.shard,
                    &commitment.binonce,
                    &group,
                    &partial,
                    &message,
                    &coordinator.lambdas,
                )
                .map_err(|_| CoordinatorError::Participant {
                    id: signer.shard.id,
                    reason: "invalid signature share".into(),
                })?;

            seen.push(incoming.pubkey);
            partials.push(partial);
            info!(count = partials.len(), need = chosen.len(), "got good partial signature");
        }

        // aggregate and double-check against the group key
        *session.status.write() = SessionStatus::Aggregating;
        let signature = configuration.aggregate_signatures(&group, &partials)?;
        if !configuration.verify_signature(&signature, &message) {
            for partial in &partials {
                let peer = chosen
                    .values()
                    .find(|signer| signer.shard.id == partial.signer_id);
                if let Some(signer) = peer {
                    let commitment = commitments
                        .iter()
                        .find(|(peer, _)| chosen[*peer].shard.id == partial.signer_id)
                        .map(|(_, c)| *c);
                    if let Some(commitment) = commitment {
                        if configuration
                            .verify_partial_signature(
                                &signer.shard,
                                &commitment.binonce,
                                &group,
                                partial,
                                &message,
                                &coordinator.lambdas,
                            )
                            .is_err()
                        {
                            return Err(CoordinatorError::Participant {
                                id: signer.shard.id,
                                reason: "invalid signature share".into(),
                            });
                        }
                    }
                }
            }
            return Err(CoordinatorError::BadAggregate);
        }

        event.sig = hex::encode(signature);
        Ok(())
    }
}

fn decode_pubkey(pubkey_hex: &str) -> Result<[u8; 32], CoordinatorError> {
    let bytes = hex::decode(pubkey_hex).map_err(promenade_common::CommonError::Hex)?;
    bytes
        .try_into()
        .map_err(|_| CoordinatorError::Store("bad aggregate pubkey length".into()))
}

fn missing<V>(chosen: &HashMap<String, RegisteredSigner>, have: &HashMap<String, V>) -> Vec<String> {
    chosen
        .keys()
        .filter(|peer| !have.contains_key(*peer))
        .cloned()
        .collect()
}

async fn recv_or_deadline(
    receiver: &mut mpsc::Receiver<Event>,
    deadline: Instant,
) -> Result<Result<Event, CoordinatorError>, ()> {
    match tokio::time::timeout_at(deadline, receiver.recv()).await {
        Ok(Some(event)) => Ok(Ok(event)),
        Ok(None) => Ok(Err(CoordinatorError::ChannelClosed)),
        Err(_) => Err(()),
    }
}

/// Route an inbound ephemeral `Commit` / `PartialSignature` to its
/// session. Unknown sessions and authors outside the chosen set are
/// dropped silently; they may be stragglers from a timed-out session.
pub fn route_signer_event(coordinator: &Coordinator, event: &Event) {
    let Some(session_id) = event.tag_value("e") else {
        return;
    };
    let Some(session) = coordinator.sessions.get(session_id) else {
        return;
    };
    if !session.chosen.contains_key(&event.pubkey) {
        warn!(pubkey = %event.pubkey, session = %session_id,
              "got signing event from unrelated signer");
        return;
    }
    session.deliver(event.clone());
}
