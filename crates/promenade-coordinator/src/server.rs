//! WebSocket/HTTP glue: frames in, policy calls, frames out. Everything
//! interesting happens behind [`Coordinator`]'s entry points; this file
//! only speaks the wire.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use promenade_common::kinds::KIND_CLIENT_AUTH;
use promenade_common::{Event, RelayInfo};

use crate::relay::Coordinator;

/// Accept loop; runs until the process exits.
pub async fn serve(coordinator: Arc<Coordinator>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, url = %coordinator.url, "coordinator listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let ip = peer.ip().to_string();
            if let Err(e) = handle_connection(coordinator, stream, ip).await {
                debug!(error = %e, "connection ended");
            }
        });
    }
}

async fn handle_connection(
    coordinator: Arc<Coordinator>,
    mut stream: TcpStream,
    ip: String,
) -> anyhow::Result<()> {
    // plain HTTP gets the relay information document (the TOFU side
    // request); websocket upgrades get the relay protocol
    let mut head = [0u8; 2048];
    let peeked = stream.peek(&mut head).await?;
    let head = String::from_utf8_lossy(&head[..peeked]).to_ascii_lowercase();
    if !head.contains("upgrade: websocket") {
        let info = RelayInfo {
            name: "promenade relay".into(),
            pubkey: coordinator.keys.public_key(),
        };
        let body = serde_json::to_string(&info)?;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/nostr+json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    let websocket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = websocket.split();

    let connection = coordinator.connect(&ip, None);
    let mut challenge_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut challenge_bytes);
    let challenge = hex::encode(challenge_bytes);
    sink.send(Message::Text(json!(["AUTH", &challenge]).to_string()))
        .await?;

    // subscription forwarders push outbound frames through one channel
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(256);
    let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    let result: anyhow::Result<()> = loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break Ok(()) };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break Ok(());
                }
            }
            message = source.next() => {
                let Some(message) = message else { break Ok(()) };
                let message = match message {
                    Ok(m) => m,
                    Err(e) => break Err(e.into()),
                };
                if message.is_close() {
                    break Ok(());
                }
                let Ok(text) = message.into_text() else { continue };
                if text.is_empty() {
                    continue;
                }
                let replies = handle_frame(
                    &coordinator,
                    connection,
                    &challenge,
                    &text,
                    &outbound,
                    &mut forwarders,
                )
                .await;
                let mut failed = false;
                for reply in replies {
                    if sink.send(Message::Text(reply)).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break Ok(());
                }
            }
        }
    };

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    coordinator.disconnect(connection);
    result
}

async fn handle_frame(
    coordinator: &Arc<Coordinator>,
    connection: u64,
    challenge: &str,
    text: &str,
    outbound: &mpsc::Sender<String>,
    forwarders: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) -> Vec<String> {
    let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
        return vec![json!(["NOTICE", "error: unparseable message"]).to_string()];
    };

    match frame.first().and_then(Value::as_str) {
        Some("EVENT") => {
            let Some(raw) = frame.get(1) else {
                return vec![json!(["NOTICE", "error: missing event"]).to_string()];
            };
            let event: Event = match serde_json::from_value(raw.clone()) {
                Ok(event) => event,
                Err(e) => {
                    return vec![
                        json!(["NOTICE", format!("invalid: {e}")]).to_string(),
                    ]
                }
            };
            let id = event.id.clone();
            match coordinator.handle_event(connection, event).await {
                Ok(()) => vec![json!(["OK", id, true, ""]).to_string()],
                Err(reason) => vec![json!(["OK", id, false, reason]).to_string()],
            }
        }
        Some("REQ") => {
            let Some(subscription) = frame.get(1).and_then(Value::as_str).map(String::from)
            else {
                return vec![json!(["NOTICE", "error: missing subscription id"]).to_string()];
            };
            let filter = frame
                .get(2)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();

            match coordinator.handle_subscribe(connection, filter) {
                Ok(mut receiver) => {
                    // the backlog is already queued; flush it before EOSE
                    let mut replies = Vec::new();
                    while let Ok(event) = receiver.try_recv() {
                        replies.push(json!(["EVENT", &subscription, event]).to_string());
                    }
                    replies.push(json!(["EOSE", &subscription]).to_string());

                    let outbound = outbound.clone();
                    let sub_id = subscription.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = receiver.recv().await {
                            let frame = json!(["EVENT", &sub_id, event]).to_string();
                            if outbound.send(frame).await.is_err() {
                                return;
                            }
                        }
                    });
                    if let Some(previous) = forwarders.insert(subscription, forwarder) {
                        previous.abort();
                    }
                    replies
                }
                Err(reason) => vec![json!(["CLOSED", subscription, reason]).to_string()],
            }
        }
        Some("CLOSE") => {
            if let Some(subscription) = frame.get(1).and_then(Value::as_str) {
                if let Some(forwarder) = forwarders.remove(subscription) {
                    forwarder.abort();
                }
            }
            Vec::new()
        }
        Some("AUTH") => {
            let Some(raw) = frame.get(1) else {
                return Vec::new();
            };
            let Ok(event) = serde_json::from_value::<Event>(raw.clone()) else {
                return Vec::new();
            };
            let id = event.id.clone();
            if event.kind == KIND_CLIENT_AUTH
                && event.tag_value("challenge") == Some(challenge)
                && event.verify()
            {
                coordinator.authenticate(connection, event.pubkey.clone());
                vec![json!(["OK", id, true, ""]).to_string()]
            } else {
                vec![json!(["OK", id, false, "auth-required: bad auth event"]).to_string()]
            }
        }
        _ => vec![json!(["NOTICE", "error: unknown message type"]).to_string()],
    }
}
