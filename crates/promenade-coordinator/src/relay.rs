//! The coordinator's relay-hosting surface: connections, subscription
//! delivery, broadcast, and the in-process [`LocalClient`] adapter that
//! lets other roles speak to a coordinator through the real policy path
//! without a socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use promenade_common::{CommonError, Event, Filter, Keys, Relay, RelayInfo};
use promenade_frost::LambdaRegistry;

use crate::ratelimit::RateLimits;
use crate::session::Session;
use crate::store::Store;

pub type ConnectionId = u64;

pub(crate) struct Connection {
    pub ip: String,
    pub authed: Option<String>,
    pub subscriptions: Vec<(Filter, mpsc::Sender<Event>)>,
    /// How many admitted signing-flow subscriptions this connection
    /// holds; each one counts once in `online_signers`.
    pub online_grants: u32,
}

/// Process-wide coordinator state, constructed once at startup and
/// threaded into every handler.
pub struct Coordinator {
    pub keys: Keys,
    pub url: String,
    pub store: Store,
    /// Signers with an admitted signing-flow subscription, refcounted.
    pub online_signers: DashMap<String, usize>,
    /// Active signing sessions by session id.
    pub sessions: DashMap<String, Arc<Session>>,
    /// Shared λ memoization across sessions.
    pub lambdas: LambdaRegistry,
    pub rate_limits: RateLimits,
    pub(crate) connections: DashMap<ConnectionId, Connection>,
    next_connection: AtomicU64,
}

impl Coordinator {
    pub fn new(keys: Keys, url: String, store: Store) -> Arc<Self> {
        Arc::new(Coordinator {
            keys,
            url,
            store,
            online_signers: DashMap::new(),
            sessions: DashMap::new(),
            lambdas: LambdaRegistry::new(),
            rate_limits: RateLimits::new(),
            connections: DashMap::new(),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Register a new connection; `authed` is the pubkey the transport
    /// layer authenticated, when it did.
    pub fn connect(&self, ip: &str, authed: Option<String>) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            Connection {
                ip: ip.to_string(),
                authed,
                subscriptions: Vec::new(),
                online_grants: 0,
            },
        );
        id
    }

    /// Mark a connection as authenticated after a verified AUTH.
    pub fn authenticate(&self, connection: ConnectionId, pubkey: String) {
        if let Some(mut conn) = self.connections.get_mut(&connection) {
            conn.authed = Some(pubkey);
        }
    }

    pub fn authed_pubkey(&self, connection: ConnectionId) -> Option<String> {
        self.connections
            .get(&connection)
            .and_then(|conn| conn.authed.clone())
    }

    pub(crate) fn connection_ip(&self, connection: ConnectionId) -> String {
        self.connections
            .get(&connection)
            .map(|conn| conn.ip.clone())
            .unwrap_or_default()
    }

    /// Tear down a connection, releasing its online-signer grants.
    pub fn disconnect(&self, connection: ConnectionId) {
        let Some((_, conn)) = self.connections.remove(&connection) else {
            return;
        };
        if conn.online_grants > 0 {
            if let Some(pubkey) = &conn.authed {
                for _ in 0..conn.online_grants {
                    self.release_online_signer(pubkey);
                }
            }
        }
    }

    pub(crate) fn grant_online_signer(&self, connection: ConnectionId, pubkey: &str) {
        info!(pubkey = %pubkey, "signer online");
        *self.online_signers.entry(pubkey.to_string()).or_insert(0) += 1;
        if let Some(mut conn) = self.connections.get_mut(&connection) {
            conn.online_grants += 1;
        }
    }

    fn release_online_signer(&self, pubkey: &str) {
        let remove = {
            let Some(mut count) = self.online_signers.get_mut(pubkey) else {
                return;
            };
            *count -= 1;
            *count == 0
        };
        if remove {
            info!(pubkey = %pubkey, "signer offline");
            self.online_signers.remove(pubkey);
        }
    }

    pub fn signer_is_online(&self, pubkey: &str) -> bool {
        self.online_signers.contains_key(pubkey)
    }

    /// Deliver an event to every live subscription it matches.
    pub async fn broadcast(&self, event: Event) {
        let mut targets: Vec<mpsc::Sender<Event>> = Vec::new();
        for conn in self.connections.iter() {
            for (filter, sender) in &conn.subscriptions {
                if filter.matches(&event) {
                    targets.push(sender.clone());
                }
            }
        }
        for sender in targets {
            let _ = sender.send(event.clone()).await;
        }
    }
}

/// In-process client for a [`Coordinator`], implementing the shared
/// [`Relay`] contract. Authentication is implicit: the client's keys are
/// treated as NIP-42-verified, which is exactly what the transport glue
/// would have established.
pub struct LocalClient {
    coordinator: Arc<Coordinator>,
    keys: Keys,
    ip: String,
    connection: Mutex<Option<ConnectionId>>,
}

impl LocalClient {
    pub fn new(coordinator: Arc<Coordinator>, keys: Keys, ip: &str) -> Self {
        LocalClient {
            coordinator,
            keys,
            ip: ip.to_string(),
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> ConnectionId {
        let mut slot = self.connection.lock();
        if let Some(id) = *slot {
            if self.coordinator.connections.contains_key(&id) {
                return id;
            }
        }
        let id = self
            .coordinator
            .connect(&self.ip, Some(self.keys.public_key()));
        *slot = Some(id);
        id
    }

    /// Drop the underlying connection, as a transport disconnect would.
    pub fn disconnect(&self) {
        if let Some(id) = self.connection.lock().take() {
            self.coordinator.disconnect(id);
        }
    }
}

#[async_trait]
impl Relay for LocalClient {
    async fn publish(&self, _url: &str, event: Event) -> promenade_common::Result<()> {
        let connection = self.connection();
        self.coordinator
            .handle_event(connection, event)
            .await
            .map_err(CommonError::Rejected)
    }

    async fn subscribe(
        &self,
        _url: &str,
        filter: Filter,
    ) -> promenade_common::Result<mpsc::Receiver<Event>> {
        let connection = self.connection();
        self.coordinator
            .handle_subscribe(connection, filter)
            .map_err(CommonError::Rejected)
    }

    async fn fetch(&self, _url: &str, filter: Filter) -> promenade_common::Result<Vec<Event>> {
        let connection = self.connection();
        self.coordinator
            .handle_fetch(connection, filter)
            .map_err(CommonError::Rejected)
    }

    async fn info(&self, _url: &str) -> promenade_common::Result<RelayInfo> {
        Ok(RelayInfo {
            name: "promenade relay".into(),
            pubkey: self.coordinator.keys.public_key(),
        })
    }
}
