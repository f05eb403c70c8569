//! WebSocket implementation of the [`Relay`](crate::bus::Relay)
//! contract: one lazily-opened connection per relay URL, shared by all
//! publishes and subscriptions against that URL.
//!
//! Wire framing is the usual JSON arrays: `["EVENT", ev]` /
//! `["REQ", sub, filter]` / `["CLOSE", sub]` outbound, and `["EVENT",
//! sub, ev]`, `["EOSE", sub]`, `["OK", id, bool, msg]`, `["CLOSED", sub,
//! msg]`, `["AUTH", challenge]`, `["NOTICE", msg]` inbound. An inbound
//! AUTH challenge is answered automatically when the pool has keys.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::CommonError;
use crate::event::{Event, Keys};
use crate::filter::Filter;
use crate::kinds::KIND_CLIENT_AUTH;
use crate::{Relay, RelayInfo, Result};

const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

enum Command {
    Publish {
        event: Event,
        ack: oneshot::Sender<std::result::Result<(), String>>,
    },
    Subscribe {
        filter: Filter,
        sender: mpsc::Sender<Event>,
    },
    Fetch {
        filter: Filter,
        done: oneshot::Sender<Vec<Event>>,
    },
}

/// A pool of WebSocket relay connections implementing [`Relay`].
pub struct WsPool {
    keys: Option<Keys>,
    connections: Mutex<HashMap<String, mpsc::Sender<Command>>>,
}

impl WsPool {
    /// `keys`, when given, are used to answer relay AUTH challenges.
    pub fn new(keys: Option<Keys>) -> Self {
        WsPool {
            keys,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, url: &str) -> Result<mpsc::Sender<Command>> {
        let mut connections = self.connections.lock().await;
        if let Some(handle) = connections.get(url) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            connections.remove(url);
        }

        let (stream, _) = connect_async(url).await.map_err(|e| CommonError::Relay {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let task = ConnectionTask {
            url: url.to_string(),
            keys: self.keys.clone(),
            subscriptions: HashMap::new(),
            fetches: HashMap::new(),
            pending_oks: HashMap::new(),
            next_subscription: 0,
        };
        tokio::spawn(task.run(stream, command_rx));

        connections.insert(url.to_string(), command_tx.clone());
        Ok(command_tx)
    }
}

#[async_trait::async_trait]
impl Relay for WsPool {
    async fn publish(&self, url: &str, event: Event) -> Result<()> {
        let connection = self.connection(url).await?;
        let (ack, ack_rx) = oneshot::channel();
        connection
            .send(Command::Publish { event, ack })
            .await
            .map_err(|_| CommonError::Relay {
                url: url.to_string(),
                reason: "connection task gone".into(),
            })?;
        match tokio::time::timeout(PUBLISH_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(CommonError::Rejected(reason)),
            Ok(Err(_)) => Err(CommonError::Relay {
                url: url.to_string(),
                reason: "connection closed before ack".into(),
            }),
            Err(_) => Err(CommonError::Timeout(format!("publish ack from {url}"))),
        }
    }

    async fn subscribe(&self, url: &str, filter: Filter) -> Result<mpsc::Receiver<Event>> {
        let connection = self.connection(url).await?;
        let (sender, receiver) = mpsc::channel(256);
        connection
            .send(Command::Subscribe { filter, sender })
            .await
            .map_err(|_| CommonError::Relay {
                url: url.to_string(),
                reason: "connection task gone".into(),
            })?;
        Ok(receiver)
    }

    async fn fetch(&self, url: &str, filter: Filter) -> Result<Vec<Event>> {
        let connection = self.connection(url).await?;
        let (done, done_rx) = oneshot::channel();
        connection
            .send(Command::Fetch { filter, done })
            .await
            .map_err(|_| CommonError::Relay {
                url: url.to_string(),
                reason: "connection task gone".into(),
            })?;
        match tokio::time::timeout(FETCH_TIMEOUT, done_rx).await {
            Ok(Ok(events)) => Ok(events),
            _ => Err(CommonError::Timeout(format!("fetch from {url}"))),
        }
    }

    async fn info(&self, url: &str) -> Result<RelayInfo> {
        // NIP-11: same address over HTTP with the info Accept header
        let http_url = url
            .replacen("wss://", "https://", 1)
            .replacen("ws://", "http://", 1);
        let body = http_get_info(&http_url).await.map_err(|reason| {
            CommonError::Relay {
                url: url.to_string(),
                reason,
            }
        })?;
        serde_json::from_str(&body).map_err(CommonError::Json)
    }
}

/// Minimal HTTP GET for the relay information document; plain HTTP only,
/// TLS endpoints are expected to sit behind a local terminator.
async fn http_get_info(url: &str) -> std::result::Result<String, String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| "only plain http supported for info documents".to_string())?;
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, format!("/{path}")),
        None => (rest, "/".to_string()),
    };
    let address = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:80")
    };

    let mut stream = TcpStream::connect(&address)
        .await
        .map_err(|e| e.to_string())?;
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nAccept: application/nostr+json\r\nConnection: close\r\n\r\n"
    );
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .map_err(|e| e.to_string())?;

    let mut response = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
        .await
        .map_err(|e| e.to_string())?;
    let response = String::from_utf8_lossy(&response);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .ok_or_else(|| "malformed http response".to_string())?;
    Ok(body)
}

struct SubscriptionState {
    filter: Filter,
    sender: mpsc::Sender<Event>,
    retried: bool,
}

struct ConnectionTask {
    url: String,
    keys: Option<Keys>,
    subscriptions: HashMap<String, SubscriptionState>,
    fetches: HashMap<String, (Filter, Vec<Event>, oneshot::Sender<Vec<Event>>, bool)>,
    pending_oks: HashMap<String, oneshot::Sender<std::result::Result<(), String>>>,
    next_subscription: u64,
}

impl ConnectionTask {
    fn subscription_id(&mut self) -> String {
        self.next_subscription += 1;
        format!("sub{}", self.next_subscription)
    }

    async fn run(
        mut self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let frame = match command {
                        Command::Publish { event, ack } => {
                            self.pending_oks.insert(event.id.clone(), ack);
                            json!(["EVENT", event]).to_string()
                        }
                        Command::Subscribe { filter, sender } => {
                            let id = self.subscription_id();
                            let frame = json!(["REQ", &id, &filter]).to_string();
                            self.subscriptions.insert(
                                id,
                                SubscriptionState { filter, sender, retried: false },
                            );
                            frame
                        }
                        Command::Fetch { filter, done } => {
                            let id = self.subscription_id();
                            let frame = json!(["REQ", &id, &filter]).to_string();
                            self.fetches.insert(id, (filter, Vec::new(), done, false));
                            frame
                        }
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                message = source.next() => {
                    let Some(Ok(message)) = message else { break };
                    let Ok(text) = message.into_text() else { continue };
                    if text.is_empty() {
                        continue;
                    }
                    if let Some(reply) = self.handle_frame(&text).await {
                        if sink.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        debug!(url = %self.url, "relay connection closed");
    }

    async fn handle_frame(&mut self, text: &str) -> Option<String> {
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
            return None;
        };
        match frame.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let subscription = frame.get(1)?.as_str()?.to_string();
                let event: Event = serde_json::from_value(frame.get(2)?.clone()).ok()?;
                if let Some((_, buffer, _, _)) = self.fetches.get_mut(&subscription) {
                    buffer.push(event);
                } else if let Some(state) = self.subscriptions.get(&subscription) {
                    if state.sender.send(event).await.is_err() {
                        self.subscriptions.remove(&subscription);
                        return Some(json!(["CLOSE", subscription]).to_string());
                    }
                }
                None
            }
            Some("EOSE") => {
                let subscription = frame.get(1)?.as_str()?.to_string();
                if let Some((_, events, done, _)) = self.fetches.remove(&subscription) {
                    let _ = done.send(events);
                    return Some(json!(["CLOSE", subscription]).to_string());
                }
                None
            }
            Some("OK") => {
                let id = frame.get(1)?.as_str()?;
                let accepted = frame.get(2)?.as_bool().unwrap_or(false);
                let reason = frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if let Some(ack) = self.pending_oks.remove(id) {
                    let _ = ack.send(if accepted { Ok(()) } else { Err(reason) });
                }
                None
            }
            Some("CLOSED") => {
                let subscription = frame.get(1)?.as_str()?.to_string();
                let reason = frame.get(2).and_then(Value::as_str).unwrap_or("");

                // the relay may have asked for AUTH after our REQ went
                // out; re-send such subscriptions once
                let retry = reason.starts_with("auth-required:") && self.keys.is_some();
                if retry {
                    if let Some(mut state) = self.subscriptions.remove(&subscription) {
                        if !state.retried {
                            state.retried = true;
                            let frame = json!(["REQ", &subscription, &state.filter]).to_string();
                            self.subscriptions.insert(subscription, state);
                            return Some(frame);
                        }
                    } else if let Some((filter, events, done, retried)) =
                        self.fetches.remove(&subscription)
                    {
                        if !retried {
                            let frame = json!(["REQ", &subscription, &filter]).to_string();
                            self.fetches.insert(subscription, (filter, events, done, true));
                            return Some(frame);
                        }
                        let _ = done.send(events);
                    }
                    return None;
                }

                warn!(url = %self.url, subscription = %subscription, reason,
                      "subscription closed by relay");
                self.subscriptions.remove(&subscription);
                if let Some((_, events, done, _)) = self.fetches.remove(&subscription) {
                    let _ = done.send(events);
                }
                None
            }
            Some("AUTH") => {
                let challenge = frame.get(1)?.as_str()?;
                let keys = self.keys.as_ref()?;
                let mut auth = Event::new(
                    KIND_CLIENT_AUTH,
                    "",
                    vec![
                        vec!["relay".into(), self.url.clone()],
                        vec!["challenge".into(), challenge.to_string()],
                    ],
                );
                auth.sign(keys).ok()?;
                Some(json!(["AUTH", auth]).to_string())
            }
            Some("NOTICE") => {
                debug!(url = %self.url, notice = ?frame.get(1), "relay notice");
                None
            }
            _ => None,
        }
    }
}
