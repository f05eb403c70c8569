//! Proof-of-work on event ids, used to gate shard acceptance.

use crate::event::Event;

/// Number of leading zero bits in a hex-encoded id.
pub fn difficulty(id_hex: &str) -> u32 {
    let mut bits = 0u32;
    for c in id_hex.chars() {
        let Some(nibble) = c.to_digit(16) else {
            return 0;
        };
        if nibble == 0 {
            bits += 4;
        } else {
            bits += nibble.leading_zeros() - 28;
            break;
        }
    }
    bits
}

/// The difficulty an event actually commits to: the achieved leading-zero
/// bits capped at the target stated in its `nonce` tag. Events without a
/// `nonce` tag commit to nothing.
pub fn committed_difficulty(event: &Event) -> u32 {
    let Some(tag) = event.find_tag("nonce") else {
        return 0;
    };
    let Some(target) = tag.get(2).and_then(|t| t.parse::<u32>().ok()) else {
        return 0;
    };
    difficulty(&event.id).min(target)
}

/// Grind the event's `nonce` tag until its id has at least `target`
/// leading zero bits. The event must be signed afterwards, since mining
/// rewrites the id.
pub fn mine(event: &mut Event, target: u32) {
    event.tags.retain(|tag| tag.first().map(|n| n != "nonce").unwrap_or(true));
    event
        .tags
        .push(vec!["nonce".into(), "0".into(), target.to_string()]);
    let nonce_index = event.tags.len() - 1;

    let mut counter: u64 = 0;
    loop {
        event.tags[nonce_index][1] = counter.to_string();
        event.id = event.compute_id();
        if difficulty(&event.id) >= target {
            return;
        }
        counter += 1;
    }
}
