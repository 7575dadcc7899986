//! Conversation Session
//!
//! Cached upstream state for one external conversation handle.

use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use crate::messages::{ConversationHandle, CredentialId};

/// The composed answer of the last completed turn, kept so a concurrent
/// duplicate of that request can be answered without calling upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnReplay {
    /// Key of the request that produced this answer
    pub request_key: String,
    /// Everything the turn emitted, concatenated
    pub content: String,
}

/// Upstream state behind one external conversation handle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSession {
    /// External handle, never changes
    pub handle: ConversationHandle,
    /// Upstream conversation id, scoped to `credential`
    pub conversation_id: String,
    /// Upstream id of the last persisted turn
    pub last_turn_id: String,
    /// Credential that owns the upstream conversation
    pub credential: CredentialId,
    /// Fingerprint of system + user messages as of the last turn
    pub fingerprint: Option<Fingerprint>,
    /// Share link for migrating to another credential
    pub share_link: Option<String>,
    /// Model of the last turn
    #[serde(default)]
    pub model: String,
    /// Creation time
    pub created_ms: u64,
    /// Last turn time, drives expiry and capacity eviction
    pub last_used_ms: u64,
    /// Turns persisted so far
    pub turns: u32,
    /// Answer of the last completed turn
    #[serde(skip)]
    pub last_turn: Option<TurnReplay>,
}

impl ConversationSession {
    /// A session for a conversation just created upstream
    #[must_use]
    pub fn new(
        handle: ConversationHandle,
        conversation_id: impl Into<String>,
        last_turn_id: impl Into<String>,
        credential: CredentialId,
        now_ms: u64,
    ) -> Self {
        Self {
            handle,
            conversation_id: conversation_id.into(),
            last_turn_id: last_turn_id.into(),
            credential,
            fingerprint: None,
            share_link: None,
            model: String::new(),
            created_ms: now_ms,
            last_used_ms: now_ms,
            turns: 0,
            last_turn: None,
        }
    }

    /// Whether the session has been idle longer than `ttl_ms`
    #[must_use]
    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_used_ms) > ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_strictly_after_ttl() {
        let s = ConversationSession::new(
            ConversationHandle::from("conv-1"),
            "c",
            "t",
            CredentialId::from("cred"),
            1_000,
        );
        assert!(!s.is_expired(1_500, 500));
        assert!(s.is_expired(1_501, 500));
    }

    #[test]
    fn test_replay_is_not_persisted() {
        let mut s = ConversationSession::new(
            ConversationHandle::from("conv-1"),
            "c",
            "t",
            CredentialId::from("cred"),
            0,
        );
        s.last_turn = Some(TurnReplay {
            request_key: "k".into(),
            content: "hello".into(),
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: ConversationSession = serde_json::from_str(&json).unwrap();
        assert!(back.last_turn.is_none());
        assert_eq!(back.handle, s.handle);
    }
}
