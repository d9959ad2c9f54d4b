use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::models::Event;

/// Run-scoped identity: the source's own id when it has one, otherwise a
/// hash of title, start and venue name.
pub fn identity_key(event: &Event) -> String {
    if let Some(uid) = event.source_uid.as_deref().filter(|uid| !uid.is_empty()) {
        return format!("uid::{uid}");
    }
    let mut hasher = Sha256::new();
    hasher.update(event.title.as_bytes());
    hasher.update(b"|");
    hasher.update(event.start_dt.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(event.venue.name.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keeps the first event seen per identity key, preserving order.
pub fn dedupe(events: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert(identity_key(event)))
        .collect()
}
