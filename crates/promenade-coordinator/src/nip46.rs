//! NIP-46 request handling: envelope decryption, method dispatch, and
//! the small policy interface the dispatcher is written against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use promenade_common::kinds::KIND_NOSTR_CONNECT;
use promenade_common::{crypto, AccountRegistration, Event, Keys};

use crate::authz;
use crate::error::CoordinatorError;
use crate::relay::Coordinator;
use crate::session::GroupContext;

/// Deadline for serving one RPC, signing rounds included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Response {
    fn ok(id: &str, result: impl Into<String>) -> Self {
        Response {
            id: id.to_string(),
            result: result.into(),
            error: String::new(),
        }
    }

    fn err(id: &str, error: impl Into<String>) -> Self {
        Response {
            id: id.to_string(),
            result: String::new(),
            error: error.into(),
        }
    }
}

/// The coordinator-specific policy behind the generic dispatcher: how to
/// find the account behind a handler key, how to get an event signed by
/// the group, and who may sign what.
#[async_trait]
pub trait RemoteSignerBackend: Send + Sync {
    fn handler_account(&self, handler_pubkey: &str) -> Option<AccountRegistration>;

    async fn sign_with_group(
        &self,
        registration: &AccountRegistration,
        event: Event,
    ) -> Result<Event, CoordinatorError>;

    fn authorize(&self, registration: &AccountRegistration, event: &Event, from: &str) -> bool;

    fn on_connect(&self, registration: &AccountRegistration, from: &str, secret: &str);
}

#[async_trait]
impl RemoteSignerBackend for Arc<Coordinator> {
    fn handler_account(&self, handler_pubkey: &str) -> Option<AccountRegistration> {
        self.store.registration_by_handler(handler_pubkey)
    }

    async fn sign_with_group(
        &self,
        registration: &AccountRegistration,
        mut event: Event,
    ) -> Result<Event, CoordinatorError> {
        let context = GroupContext::new(registration.clone());
        context
            .sign_event(self, &mut event, REQUEST_TIMEOUT)
            .await?;
        Ok(event)
    }

    fn authorize(&self, registration: &AccountRegistration, event: &Event, from: &str) -> bool {
        authz::authorize(&self.store, registration, event, from)
    }

    fn on_connect(&self, registration: &AccountRegistration, from: &str, secret: &str) {
        self.store
            .put_association(from, &registration.pubkey, secret);
    }
}

/// Decrypt, dispatch and answer one NIP-46 request. Hard failures
/// (unknown handler, undecryptable payload) return `Err` and produce no
/// response; method-level failures travel back inside the response.
pub async fn handle_request<B: RemoteSignerBackend>(
    backend: &B,
    event: &Event,
) -> Result<Event, CoordinatorError> {
    let handler_pubkey = event
        .tag_value("p")
        .ok_or_else(|| CoordinatorError::Rpc("missing 'p' tag".into()))?;

    let registration = backend
        .handler_account(handler_pubkey)
        .ok_or_else(|| CoordinatorError::UnknownHandler(handler_pubkey.to_string()))?;
    let handler_keys: Keys = registration.handler_secret.clone();

    let plaintext = crypto::decrypt(&handler_keys, &event.pubkey, &event.content)?;
    let request: Request =
        serde_json::from_str(&plaintext).map_err(|e| CoordinatorError::Rpc(e.to_string()))?;

    let response = dispatch(backend, &registration, &request, &event.pubkey).await;
    info!(method = %request.method, client = %event.pubkey,
          ok = response.error.is_empty(), "handled bunker request");

    let payload =
        serde_json::to_string(&response).map_err(|e| CoordinatorError::Rpc(e.to_string()))?;
    let mut reply = Event::new(
        KIND_NOSTR_CONNECT,
        crypto::encrypt(&handler_keys, &event.pubkey, &payload)?,
        vec![vec!["p".into(), event.pubkey.clone()]],
    );
    reply.sign(&handler_keys)?;
    Ok(reply)
}

async fn dispatch<B: RemoteSignerBackend>(
    backend: &B,
    registration: &AccountRegistration,
    request: &Request,
    from: &str,
) -> Response {
    match request.method.as_str() {
        "connect" => {
            // params: [remote_signer_pubkey, secret]
            let secret = request.params.get(1).cloned().unwrap_or_default();
            backend.on_connect(registration, from, &secret);
            Response::ok(&request.id, "ack")
        }
        "get_public_key" => Response::ok(&request.id, &registration.pubkey),
        "ping" => Response::ok(&request.id, "pong"),
        "sign_event" => {
            let Some(raw) = request.params.first() else {
                return Response::err(&request.id, "missing event parameter");
            };
            let event: Event = match serde_json::from_str(raw) {
                Ok(event) => event,
                Err(e) => return Response::err(&request.id, format!("invalid event: {e}")),
            };
            if !backend.authorize(registration, &event, from) {
                return Response::err(&request.id, "unauthorized");
            }
            match backend.sign_with_group(registration, event).await {
                Ok(signed) => match serde_json::to_string(&signed) {
                    Ok(json) => Response::ok(&request.id, json),
                    Err(e) => Response::err(&request.id, e.to_string()),
                },
                Err(e) => Response::err(&request.id, e.to_string()),
            }
        }
        "nip04_encrypt" | "nip04_decrypt" | "nip44_encrypt" | "nip44_decrypt" => {
            // the group key never encrypts or decrypts anything
            Response::err(&request.id, "unsupported")
        }
        other => Response::err(&request.id, format!("unsupported method: {other}")),
    }
}

/// Entry point used by event ingress: run the request, apply the two
/// rate-limiting axes, broadcast the response.
pub async fn handle_nip46_request(coordinator: &Arc<Coordinator>, ip: &str, event: Event) {
    match handle_request(coordinator, &event).await {
        Ok(response) => {
            coordinator.rate_limits.note_client_success(&event.pubkey);
            coordinator.broadcast(response).await;
        }
        Err(e) => {
            warn!(error = %e, client = %event.pubkey, "failed to handle bunker request");
            coordinator.rate_limits.note_ip_failure(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promenade_common::{new_profile_secret, AccountProfile, PROFILE_ROOT};

    struct FakeBackend {
        registration: AccountRegistration,
    }

    #[async_trait]
    impl RemoteSignerBackend for FakeBackend {
        fn handler_account(&self, handler_pubkey: &str) -> Option<AccountRegistration> {
            (self.registration.handler_pubkey() == handler_pubkey)
                .then(|| self.registration.clone())
        }

        async fn sign_with_group(
            &self,
            _registration: &AccountRegistration,
            mut event: Event,
        ) -> Result<Event, CoordinatorError> {
            event.sig = "f".repeat(128);
            Ok(event)
        }

        fn authorize(
            &self,
            _registration: &AccountRegistration,
            event: &Event,
            _from: &str,
        ) -> bool {
            event.kind == 1
        }

        fn on_connect(&self, _registration: &AccountRegistration, _from: &str, _secret: &str) {}
    }

    fn backend() -> FakeBackend {
        FakeBackend {
            registration: AccountRegistration {
                pubkey: "ab".repeat(32),
                handler_secret: Keys::generate(),
                threshold: 1,
                signers: vec![],
                profiles: vec![AccountProfile {
                    name: PROFILE_ROOT.into(),
                    secret: new_profile_secret(),
                    restrictions: None,
                }],
            },
        }
    }

    fn rpc_event(backend: &FakeBackend, client: &Keys, request: &Request) -> Event {
        let handler_pubkey = backend.registration.handler_pubkey();
        let payload = serde_json::to_string(request).unwrap();
        let mut event = Event::new(
            KIND_NOSTR_CONNECT,
            crypto::encrypt(client, &handler_pubkey, &payload).unwrap(),
            vec![vec!["p".into(), handler_pubkey]],
        );
        event.sign(client).unwrap();
        event
    }

    fn open_response(backend: &FakeBackend, client: &Keys, reply: &Event) -> Response {
        let plaintext = crypto::decrypt(
            &backend.registration.handler_secret,
            &client.public_key(),
            &reply.content,
        )
        .unwrap();
        serde_json::from_str(&plaintext).unwrap()
    }

    #[tokio::test]
    async fn get_public_key_returns_the_group_key() {
        let backend = backend();
        let client = Keys::generate();
        let request = Request {
            id: "1".into(),
            method: "get_public_key".into(),
            params: vec![],
        };
        let reply = handle_request(&backend, &rpc_event(&backend, &client, &request))
            .await
            .unwrap();
        assert_eq!(reply.kind, KIND_NOSTR_CONNECT);
        assert_eq!(reply.tag_value("p"), Some(client.public_key().as_str()));

        let response = open_response(&backend, &client, &reply);
        assert_eq!(response.result, backend.registration.pubkey);
        assert!(response.error.is_empty());
    }

    #[tokio::test]
    async fn encryption_methods_are_unsupported() {
        let backend = backend();
        let client = Keys::generate();
        for method in ["nip04_encrypt", "nip04_decrypt", "nip44_encrypt", "nip44_decrypt"] {
            let request = Request {
                id: "2".into(),
                method: method.into(),
                params: vec!["x".into()],
            };
            let reply = handle_request(&backend, &rpc_event(&backend, &client, &request))
                .await
                .unwrap();
            let response = open_response(&backend, &client, &reply);
            assert_eq!(response.error, "unsupported");
        }
    }

    #[tokio::test]
    async fn unauthorized_sign_event_is_refused() {
        let backend = backend();
        let client = Keys::generate();
        let to_sign = Event::new(7, "nope", vec![]);
        let request = Request {
            id: "3".into(),
            method: "sign_event".into(),
            params: vec![serde_json::to_string(&to_sign).unwrap()],
        };
        let reply = handle_request(&backend, &rpc_event(&backend, &client, &request))
            .await
            .unwrap();
        let response = open_response(&backend, &client, &reply);
        assert_eq!(response.error, "unauthorized");
    }

    #[tokio::test]
    async fn unknown_handler_is_a_hard_failure() {
        let backend = backend();
        let client = Keys::generate();
        let request = Request {
            id: "4".into(),
            method: "ping".into(),
            params: vec![],
        };
        let mut event = rpc_event(&backend, &client, &request);
        event.tags = vec![vec!["p".into(), "cc".repeat(32)]];
        event.sign(&client).unwrap();
        assert!(matches!(
            handle_request(&backend, &event).await,
            Err(CoordinatorError::UnknownHandler(_))
        ));
    }
}
