//! The signer's own refusal rules, independent of whatever the
//! coordinator already enforced.

use promenade_common::kinds::{BUNKER_CHALLENGE_PREFIX, FORBIDDEN_KINDS, KIND_CLIENT_AUTH};
use promenade_common::Event;

/// Why this event must not be signed, if it must not. Checked against
/// the event even when a coordinator tries to route it through.
pub fn refuse_reason(event: &Event, coordinator_url: &str) -> Option<String> {
    if FORBIDDEN_KINDS.contains(&event.kind) {
        return Some(format!("kind {} is forbidden", event.kind));
    }
    if event.kind == KIND_CLIENT_AUTH {
        if let Some(challenge) = event.tag_value("challenge") {
            if challenge.starts_with(BUNKER_CHALLENGE_PREFIX) {
                return Some("auth challenge issued to a bunker client".into());
            }
        }
        if let Some(relay) = event.tag_value("relay") {
            if relay == coordinator_url {
                return Some("auth event targets our own coordinator".into());
            }
        }
    }
    None
}
