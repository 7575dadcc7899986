//! Content Fingerprints
//!
//! Stateless clients resend the whole history every turn. To recognize such a
//! request as the continuation of a known conversation, the store indexes each
//! session by a hash of its system and user messages:
//!
//! - at storage time over {system + all user messages}
//! - at lookup time over {system + all user messages except the last}
//!
//! A client that sends `[sys, u1, a1, u2]` therefore looks up the fingerprint
//! of `[sys, u1]`, which is what was stored after the turn that answered `u1`.
//! Assistant messages never contribute.
//!
//! The digest is SHA-256 over a length-prefixed encoding (role tag, little
//! endian u64 length, bytes) so message boundaries cannot be forged by
//! concatenation.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::messages::{ChatMessage, Role};

/// Hex-encoded SHA-256 content fingerprint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}

/// Fingerprint recorded after a turn: system plus every user message
///
/// Returns `None` when the list has no user message.
#[must_use]
pub fn storage_fingerprint(messages: &[ChatMessage]) -> Option<Fingerprint> {
    let users = messages.iter().filter(|m| m.role == Role::User).count();
    if users == 0 {
        return None;
    }
    Some(digest(included(messages, users)))
}

/// Fingerprint used to find the session an incoming request continues
///
/// Returns `None` when there is no earlier user message, so a first turn
/// never matches anything.
#[must_use]
pub fn lookup_fingerprint(messages: &[ChatMessage]) -> Option<Fingerprint> {
    let users = messages.iter().filter(|m| m.role == Role::User).count();
    if users < 2 {
        return None;
    }
    Some(digest(included(messages, users - 1)))
}

/// Key identifying a complete request, used to recognize duplicate turns
#[must_use]
pub fn request_key(model: &str, messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    absorb(&mut hasher, b'm', model);
    for message in messages {
        let tag = match message.role {
            Role::System => b's',
            Role::User => b'u',
            Role::Assistant => b'a',
            Role::Tool => b't',
        };
        absorb(&mut hasher, tag, &message.text());
    }
    hex::encode(hasher.finalize())
}

/// System messages plus the first `user_limit` user messages, in order
fn included(messages: &[ChatMessage], user_limit: usize) -> impl Iterator<Item = &ChatMessage> {
    let mut users_seen = 0;
    messages.iter().filter(move |m| match m.role {
        Role::System => true,
        Role::User => {
            users_seen += 1;
            users_seen <= user_limit
        }
        Role::Assistant | Role::Tool => false,
    })
}

fn digest<'a>(messages: impl Iterator<Item = &'a ChatMessage>) -> Fingerprint {
    let mut hasher = Sha256::new();
    for message in messages {
        let tag = if message.role == Role::System { b's' } else { b'u' };
        absorb(&mut hasher, tag, &message.text());
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

fn absorb(hasher: &mut Sha256, tag: u8, text: &str) {
    hasher.update([tag]);
    hasher.update((text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}
