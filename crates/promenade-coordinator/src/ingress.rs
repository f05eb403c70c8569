//! Event ingress and subscription policy: the coordinator accepts only
//! what the signing protocol needs and nothing else.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use promenade_common::kinds::{
    KIND_ACCOUNT_REGISTRATION, KIND_COMMIT, KIND_CONFIGURATION, KIND_EVENT_TO_BE_SIGNED,
    KIND_GROUP_COMMIT, KIND_NOSTR_CONNECT, KIND_PARTIAL_SIGNATURE, KIND_SHARD_ACK,
};
use promenade_common::{AccountRegistration, Event, Filter};

use crate::nip46;
use crate::relay::{ConnectionId, Coordinator};
use crate::session::route_signer_event;

impl Coordinator {
    /// Ingress policy and dispatch for one published event. `Err` carries
    /// the prefixed rejection reason the relay layer reports back.
    pub async fn handle_event(
        self: &Arc<Self>,
        connection: ConnectionId,
        event: Event,
    ) -> Result<(), String> {
        if !event.verify() {
            return Err("invalid: event id or signature is broken".into());
        }

        // clients get rate-limited before we do any work for them
        if event.kind == KIND_NOSTR_CONNECT {
            if self.rate_limits.client_blocked(&event.pubkey) {
                return Err("rate-limited: you're making too many bunker calls".into());
            }
            let ip = self.connection_ip(connection);
            if self.rate_limits.ip_blocked(&ip) {
                return Err("rate-limited: you're making too many failed rpc calls".into());
            }

            let coordinator = self.clone();
            tokio::spawn(async move {
                nip46::handle_nip46_request(&coordinator, &ip, event).await;
            });
            return Ok(());
        }

        if event.is_ephemeral() {
            return match event.kind {
                KIND_COMMIT | KIND_PARTIAL_SIGNATURE => {
                    route_signer_event(self, &event);
                    Ok(())
                }
                _ => Err("blocked: this event is not accepted".into()),
            };
        }

        if event.kind == KIND_ACCOUNT_REGISTRATION {
            let registration = AccountRegistration::decode(&event).map_err(|e| {
                format!("error: account registration event is malformed: {e}")
            })?;
            self.register_account(event, registration).await;
            return Ok(());
        }

        Err("blocked: this event is not accepted".into())
    }

    /// Store a valid registration and tell each of its signers, so the
    /// acceptor handshake can complete.
    async fn register_account(
        self: &Arc<Self>,
        event: Event,
        registration: AccountRegistration,
    ) {
        let signers: Vec<String> = registration
            .signers
            .iter()
            .map(|signer| signer.peer_pubkey.clone())
            .collect();
        info!(pubkey = %registration.pubkey, signers = ?signers, "account registered");

        let user_pubkey = registration.pubkey.clone();
        self.store.put_registration(event, registration);

        for signer in signers {
            let mut ack = Event::new(
                KIND_SHARD_ACK,
                "",
                vec![
                    vec!["P".into(), user_pubkey.clone()],
                    vec!["p".into(), signer],
                ],
            );
            if let Err(e) = ack.sign(&self.keys) {
                warn!(error = %e, "failed to sign registration ack");
                continue;
            }
            self.broadcast(ack).await;
        }
    }

    /// Subscription policy. Allowed shapes, per the protocol:
    /// NIP-46 listeners; a user reading their own registration; a
    /// registered signer listening for its signing-flow events (which
    /// also marks it online); the acceptor-handshake ack listener.
    pub fn handle_subscribe(
        &self,
        connection: ConnectionId,
        filter: Filter,
    ) -> Result<mpsc::Receiver<Event>, String> {
        self.check_filter(connection, &filter)?;

        let backlog = self.store.events_matching(&filter);
        let (sender, receiver) = mpsc::channel(backlog.len() + 256);
        for event in backlog {
            let _ = sender.try_send(event);
        }
        if let Some(mut conn) = self.connections.get_mut(&connection) {
            conn.subscriptions.push((filter, sender));
        }
        Ok(receiver)
    }

    /// One-shot query under the same policy as subscriptions.
    pub fn handle_fetch(
        &self,
        connection: ConnectionId,
        filter: Filter,
    ) -> Result<Vec<Event>, String> {
        self.check_filter(connection, &filter)?;
        Ok(self.store.events_matching(&filter))
    }

    fn check_filter(&self, connection: ConnectionId, filter: &Filter) -> Result<(), String> {
        // nip-46 listeners are allowed
        if filter.kinds == [KIND_NOSTR_CONNECT] {
            return Ok(());
        }

        // everything else requires authentication
        let Some(requester) = self.authed_pubkey(connection) else {
            return Err("auth-required: signers must authenticate".into());
        };

        // users may read their own registration event
        if filter.kinds == [KIND_ACCOUNT_REGISTRATION] {
            if filter.authors == [requester.clone()] {
                return Ok(());
            }
            return Err("restricted: you can only read your own account registration".into());
        }

        // aside from that, only events addressed to the requester itself
        if filter.p_tags.len() != 1 || filter.p_tags[0] != requester {
            return Err("restricted: needs a single 'p' tag equal to your own pubkey".into());
        }

        let signing_flow = [KIND_CONFIGURATION, KIND_GROUP_COMMIT, KIND_EVENT_TO_BE_SIGNED];
        if !filter.kinds.is_empty()
            && filter.kinds.iter().all(|kind| signing_flow.contains(kind))
        {
            // the signing flow: only registered signers, and listening
            // here is what makes a signer count as online
            if !self.store.is_registered_signer(&requester) {
                return Err("restricted: you are not a signer".into());
            }
            self.grant_online_signer(connection, &requester);
            return Ok(());
        }

        if filter.kinds == [KIND_SHARD_ACK] {
            // the initial acceptor handshake
            return Ok(());
        }

        Err("filter is missing required kinds".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use promenade_common::{
        new_profile_secret, AccountProfile, Keys, RegisteredSigner, PROFILE_ROOT,
    };
    use promenade_frost::trusted_deal;

    fn coordinator_with_registration() -> (Arc<Coordinator>, AccountRegistration, Keys) {
        let coordinator = Coordinator::new(
            Keys::generate(),
            "ws://localhost:6363".into(),
            Store::in_memory(),
        );
        let user = Keys::generate();
        let (shards, _, _) = trusted_deal(user.secret_scalar(), 2, 3).unwrap();
        let registration = AccountRegistration {
            pubkey: user.public_key(),
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
        let mut event = registration.encode();
        event.sign(&user).unwrap();
        let decoded = AccountRegistration::decode(&event).unwrap();
        coordinator.store.put_registration(event, decoded);
        (coordinator, registration, user)
    }

    #[tokio::test]
    async fn rejects_random_persistent_events() {
        let (coordinator, _, _) = coordinator_with_registration();
        let keys = Keys::generate();
        let connection = coordinator.connect("127.0.0.1", None);

        let mut note = Event::new(1, "hello", vec![]);
        note.sign(&keys).unwrap();
        let rejection = coordinator
            .handle_event(connection, note)
            .await
            .unwrap_err();
        assert!(rejection.starts_with("blocked:"));
    }

    #[tokio::test]
    async fn rejects_events_with_broken_signatures() {
        let (coordinator, _, _) = coordinator_with_registration();
        let keys = Keys::generate();
        let connection = coordinator.connect("127.0.0.1", None);

        let mut note = Event::new(1, "hello", vec![]);
        note.sign(&keys).unwrap();
        note.content = "altered".into();
        let rejection = coordinator
            .handle_event(connection, note)
            .await
            .unwrap_err();
        assert!(rejection.starts_with("invalid:"));
    }

    #[tokio::test]
    async fn unauthenticated_subscriptions_are_rejected() {
        let (coordinator, _, _) = coordinator_with_registration();
        let connection = coordinator.connect("127.0.0.1", None);
        let filter = Filter::kinds(vec![KIND_CONFIGURATION]).with_p_tag("whoever");
        let rejection = coordinator
            .handle_subscribe(connection, filter)
            .unwrap_err();
        assert!(rejection.starts_with("auth-required:"));
    }

    #[tokio::test]
    async fn nip46_listeners_need_no_auth() {
        let (coordinator, _, _) = coordinator_with_registration();
        let connection = coordinator.connect("127.0.0.1", None);
        assert!(coordinator
            .handle_subscribe(connection, Filter::kinds(vec![KIND_NOSTR_CONNECT]))
            .is_ok());
    }

    #[tokio::test]
    async fn users_can_only_read_their_own_registration() {
        let (coordinator, registration, user) = coordinator_with_registration();
        let connection = coordinator.connect("127.0.0.1", Some(user.public_key()));

        let own = Filter {
            kinds: vec![KIND_ACCOUNT_REGISTRATION],
            authors: vec![user.public_key()],
            ..Default::default()
        };
        let mut receiver = coordinator.handle_subscribe(connection, own).unwrap();
        let replayed = receiver.try_recv().unwrap();
        assert_eq!(replayed.pubkey, registration.pubkey);

        let other = Filter {
            kinds: vec![KIND_ACCOUNT_REGISTRATION],
            authors: vec!["ff".repeat(32)],
            ..Default::default()
        };
        let rejection = coordinator.handle_subscribe(connection, other).unwrap_err();
        assert!(rejection.starts_with("restricted:"));
    }

    #[tokio::test]
    async fn signing_flow_subscription_marks_signer_online_until_disconnect() {
        let (coordinator, registration, _) = coordinator_with_registration();
        let signer = registration.signers[0].peer_pubkey.clone();
        let connection = coordinator.connect("127.0.0.1", Some(signer.clone()));

        let filter = Filter::kinds(vec![
            KIND_CONFIGURATION,
            KIND_GROUP_COMMIT,
            KIND_EVENT_TO_BE_SIGNED,
        ])
        .with_p_tag(signer.clone());
        coordinator.handle_subscribe(connection, filter).unwrap();
        assert!(coordinator.signer_is_online(&signer));

        coordinator.disconnect(connection);
        assert!(!coordinator.signer_is_online(&signer));
    }

    #[tokio::test]
    async fn non_signers_cannot_join_the_signing_flow() {
        let (coordinator, _, _) = coordinator_with_registration();
        let outsider = Keys::generate().public_key();
        let connection = coordinator.connect("127.0.0.1", Some(outsider.clone()));

        let filter = Filter::kinds(vec![KIND_CONFIGURATION]).with_p_tag(outsider);
        let rejection = coordinator
            .handle_subscribe(connection, filter)
            .unwrap_err();
        assert_eq!(rejection, "restricted: you are not a signer");
    }

    #[tokio::test]
    async fn registration_event_is_stored_and_acked() {
        let (coordinator, _, _) = coordinator_with_registration();

        let user = Keys::generate();
        let (shards, _, _) = trusted_deal(user.secret_scalar(), 2, 2).unwrap();
        let signer_keys = Keys::generate();
        let registration = AccountRegistration {
            pubkey: user.public_key(),
            handler_secret: Keys::generate(),
            threshold: 2,
            signers: shards
                .iter()
                .map(|shard| RegisteredSigner {
                    peer_pubkey: signer_keys.public_key(),
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
        event.sign(&user).unwrap();

        // the signer is subscribed for acks already
        let signer_conn = coordinator.connect("10.0.0.1", Some(signer_keys.public_key()));
        let mut acks = coordinator
            .handle_subscribe(
                signer_conn,
                Filter::kinds(vec![KIND_SHARD_ACK]).with_p_tag(signer_keys.public_key()),
            )
            .unwrap();

        let publisher = coordinator.connect("10.0.0.2", None);
        coordinator.handle_event(publisher, event).await.unwrap();

        assert!(coordinator
            .store
            .registration_by_pubkey(&user.public_key())
            .is_some());
        let ack = acks.recv().await.unwrap();
        assert_eq!(ack.kind, KIND_SHARD_ACK);
        assert_eq!(ack.tag_value("P"), Some(user.public_key().as_str()));
    }
}
