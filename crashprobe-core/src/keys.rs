//! Unique event identifier generators.
//!
//! Two shapes are produced: a 20-hex-char generic key used in history
//! records and archive directory names, and a 32-hex-char digest keyed by a
//! telemetry class string.

use sha2::{Digest, Sha256};
use uuid::Uuid;

const EVENT_KEY_LEN: usize = 20;
const CLASS_DIGEST_LEN: usize = 32;

fn digest(parts: &[&str], len: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(len);
    hex
}

/// Generate a globally unique event key seeded by the event kind and the
/// classified subject name.
pub fn event_key(kind: &str, name: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    digest(&[kind, name, &nonce], EVENT_KEY_LEN)
}

/// Generate a fixed-length telemetry event id keyed by a class string.
pub fn class_digest(class: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    digest(&[class, &nonce], CLASS_DIGEST_LEN)
}
