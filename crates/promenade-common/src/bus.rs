//! The transport contract between roles, and an in-memory relay used by
//! tests and local simulation.
//!
//! The production WebSocket transport lives in [`crate::net`]; both
//! implement [`Relay`], so every role is written against the trait and
//! never against a concrete wire.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::CommonError;
use crate::event::Event;
use crate::filter::Filter;
use crate::Result;

/// What a relay advertises about itself; the `pubkey` is what signers
/// TOFU-pin for a coordinator.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RelayInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pubkey: String,
}

/// Client view of the event bus.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Publish an event; errors carry the relay's rejection reason.
    async fn publish(&self, url: &str, event: Event) -> Result<()>;

    /// Open a long-lived subscription; matching stored events are
    /// replayed first, then live matches stream in.
    async fn subscribe(&self, url: &str, filter: Filter) -> Result<mpsc::Receiver<Event>>;

    /// One-shot query: stored events matching `filter`.
    async fn fetch(&self, url: &str, filter: Filter) -> Result<Vec<Event>>;

    /// The relay's advertised information document.
    async fn info(&self, url: &str) -> Result<RelayInfo>;
}

struct MemorySubscription {
    url: String,
    filter: Filter,
    sender: mpsc::Sender<Event>,
}

/// In-process relay network: any number of relay URLs backed by one
/// store, with live fan-out to subscribers.
#[derive(Default)]
pub struct MemoryRelay {
    stored: RwLock<Vec<(String, Event)>>,
    subscriptions: DashMap<u64, MemorySubscription>,
    infos: DashMap<String, RelayInfo>,
    next_subscription: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure what `info()` returns for a URL.
    pub fn set_info(&self, url: &str, info: RelayInfo) {
        self.infos.insert(url.to_string(), info);
    }

    fn stored_matching(&self, url: &str, filter: &Filter) -> Vec<Event> {
        self.stored
            .read()
            .iter()
            .filter(|(stored_url, event)| stored_url == url && filter.matches(event))
            .map(|(_, event)| event.clone())
            .collect()
    }

    async fn fan_out(&self, url: &str, event: &Event) {
        let mut dead = Vec::new();
        let targets: Vec<(u64, mpsc::Sender<Event>)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.url == url && entry.filter.matches(event))
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect();
        for (id, sender) in targets {
            if sender.send(event.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.subscriptions.remove(&id);
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(&self, url: &str, event: Event) -> Result<()> {
        if !event.is_ephemeral() {
            self.stored.write().push((url.to_string(), event.clone()));
        }
        self.fan_out(url, &event).await;
        Ok(())
    }

    async fn subscribe(&self, url: &str, filter: Filter) -> Result<mpsc::Receiver<Event>> {
        let backlog = self.stored_matching(url, &filter);
        let (sender, receiver) = mpsc::channel(backlog.len() + 64);
        for event in backlog {
            let _ = sender.send(event).await;
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            MemorySubscription {
                url: url.to_string(),
                filter,
                sender,
            },
        );
        Ok(receiver)
    }

    async fn fetch(&self, url: &str, filter: Filter) -> Result<Vec<Event>> {
        Ok(self.stored_matching(url, &filter))
    }

    async fn info(&self, url: &str) -> Result<RelayInfo> {
        self.infos
            .get(url)
            .map(|info| info.clone())
            .ok_or_else(|| CommonError::Relay {
                url: url.to_string(),
                reason: "no info document".into(),
            })
    }
}
