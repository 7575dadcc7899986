//! Scripted Upstream
//!
//! In-process stand-in for the upstream service, used by tests and by the
//! daemon's `--offline` mode. It keeps a small model of upstream state so the
//! relay's bookkeeping can be checked end to end:
//!
//! - conversations belong to the credential that created (or cloned) them
//! - appending to another credential's conversation fails like upstream does
//! - share links snapshot a conversation at a turn; cloning yields fresh ids
//!
//! By default each turn answers `answer to: <message>`. Tests can queue
//! explicit event sequences, inject failures per credential, and hold turns
//! open until released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use super::traits::{
    ClonedConversation, QuotaStatus, UpstreamClient, UpstreamError, UpstreamEvent,
    UpstreamTurn,
};
use crate::credentials::{CredentialLease, Tier};
use crate::messages::CredentialId;

/// Kind of upstream call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `create_conversation`
    Create,
    /// `append_response`
    Append,
    /// `create_share_link`
    Share,
    /// `clone_share_link`
    Clone,
    /// `check_quota`
    QuotaCheck,
}

/// One call the scripted upstream received
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    /// Call kind
    pub kind: CallKind,
    /// Credential the call was made with
    pub credential: CredentialId,
    /// Conversation addressed, if any
    pub conversation_id: Option<String>,
    /// Parent turn for appends, or the turn shared
    pub turn_id: Option<String>,
    /// Message sent, for turn calls
    pub message: Option<String>,
}

#[derive(Debug)]
struct Conversation {
    owner: CredentialId,
    last_turn_id: String,
}

#[derive(Debug, Default)]
struct ScriptState {
    conversations: HashMap<String, Conversation>,
    share_links: HashMap<String, (String, String)>,
    scripted_turns: VecDeque<Vec<UpstreamEvent>>,
    next_failures: HashMap<CredentialId, VecDeque<UpstreamError>>,
    persistent_failures: HashMap<CredentialId, UpstreamError>,
    share_failures: VecDeque<UpstreamError>,
    clone_failures: VecDeque<UpstreamError>,
    quotas: HashMap<CredentialId, QuotaStatus>,
    calls: Vec<RecordedCall>,
}

/// Scripted in-process upstream
#[derive(Debug)]
pub struct ScriptedUpstream {
    state: Mutex<ScriptState>,
    ids: AtomicU64,
    held: AtomicBool,
    gate: Arc<Semaphore>,
    shares_held: AtomicBool,
    share_gate: Semaphore,
}

impl Default for ScriptedUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedUpstream {
    /// Create an upstream with no conversations
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            ids: AtomicU64::new(1),
            held: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(0)),
            shares_held: AtomicBool::new(false),
            share_gate: Semaphore::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Answer the next turn call with exactly these events
    pub fn script_turn(&self, events: Vec<UpstreamEvent>) {
        self.state.lock().scripted_turns.push_back(events);
    }

    /// Fail the next turn, share or clone call made with `credential`
    pub fn fail_next(&self, credential: &CredentialId, error: UpstreamError) {
        self.state
            .lock()
            .next_failures
            .entry(credential.clone())
            .or_default()
            .push_back(error);
    }

    /// Fail every call made with `credential` until [`Self::heal`]
    pub fn fail_always(&self, credential: &CredentialId, error: UpstreamError) {
        self.state
            .lock()
            .persistent_failures
            .insert(credential.clone(), error);
    }

    /// Stop failing calls made with `credential`
    pub fn heal(&self, credential: &CredentialId) {
        let mut state = self.state.lock();
        state.persistent_failures.remove(credential);
        state.next_failures.remove(credential);
    }

    /// Fail the next share-link request
    pub fn fail_next_share(&self, error: UpstreamError) {
        self.state.lock().share_failures.push_back(error);
    }

    /// Fail the next clone
    pub fn fail_next_clone(&self, error: UpstreamError) {
        self.state.lock().clone_failures.push_back(error);
    }

    /// Answer quota checks for `credential` with `status`
    pub fn set_quota_status(&self, credential: &CredentialId, status: QuotaStatus) {
        self.state.lock().quotas.insert(credential.clone(), status);
    }

    /// Hold every turn open before its final event until released
    pub fn hold_turns(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let `n` held turns finish
    pub fn release_turns(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Hold every share-link request until released
    pub fn hold_shares(&self) {
        self.shares_held.store(true, Ordering::SeqCst);
    }

    /// Let `n` held share-link requests answer
    pub fn release_shares(&self, n: usize) {
        self.share_gate.add_permits(n);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Every call received, in order
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `kind`
    #[must_use]
    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .count()
    }

    /// Owner of an upstream conversation
    #[must_use]
    pub fn owner_of(&self, conversation_id: &str) -> Option<CredentialId> {
        self.state
            .lock()
            .conversations
            .get(conversation_id)
            .map(|c| c.owner.clone())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.ids.fetch_add(1, Ordering::Relaxed))
    }

    fn record(state: &mut ScriptState, call: RecordedCall) -> Result<(), UpstreamError> {
        let credential = call.credential.clone();
        // Quota checks run in the background and must not eat one-shot failures
        let one_shot = call.kind != CallKind::QuotaCheck;
        state.calls.push(call);
        if let Some(error) = state
            .next_failures
            .get_mut(&credential)
            .filter(|_| one_shot)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = state.persistent_failures.get(&credential) {
            return Err(error.clone());
        }
        Ok(())
    }

    fn not_found(what: &str, id: &str) -> UpstreamError {
        UpstreamError::Unavailable(format!("HTTP 404: {what} {id} not found"))
    }

    /// Produce the events of one turn and stream them on a spawned task
    fn spawn_turn(
        &self,
        conversation_id: &str,
        is_new: bool,
        turn: &UpstreamTurn,
    ) -> mpsc::Receiver<UpstreamEvent> {
        let scripted = self.state.lock().scripted_turns.pop_front();
        let mut events = scripted.unwrap_or_else(|| {
            let user_turn = self.next_id("user");
            let response = self.next_id("resp");
            let answer = format!("answer to: {}", turn.message);
            let mut events = Vec::new();
            if is_new {
                events.push(UpstreamEvent::Conversation {
                    conversation_id: conversation_id.to_string(),
                });
            }
            events.push(UpstreamEvent::Acknowledged { turn_id: user_turn });
            events.push(UpstreamEvent::Token {
                text: answer.clone(),
                thinking: false,
            });
            events.push(UpstreamEvent::Final {
                turn_id: response,
                message: answer,
                image_urls: Vec::new(),
            });
            events
        });
        // Upstream always names a new conversation first
        if is_new && !matches!(events.first(), Some(UpstreamEvent::Conversation { .. })) {
            events.insert(
                0,
                UpstreamEvent::Conversation {
                    conversation_id: conversation_id.to_string(),
                },
            );
        }

        // Track the newest acknowledged turn so later appends and shares see it
        if let Some(last) = events.iter().rev().find_map(|e| match e {
            UpstreamEvent::Final { turn_id, .. } | UpstreamEvent::Acknowledged { turn_id } => {
                Some(turn_id.clone())
            }
            _ => None,
        }) {
            if let Some(conv) = self.state.lock().conversations.get_mut(conversation_id) {
                conv.last_turn_id = last;
            }
        }

        let (tx, rx) = mpsc::channel(8);
        let held = self.held.load(Ordering::SeqCst);
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            for event in events {
                let terminal = matches!(event, UpstreamEvent::Final { .. });
                if terminal && held {
                    match gate.acquire().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => return,
                    }
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn create_conversation(
        &self,
        lease: &CredentialLease,
        turn: &UpstreamTurn,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        let conversation_id = self.next_id("conv");
        {
            let mut state = self.state.lock();
            Self::record(
                &mut state,
                RecordedCall {
                    kind: CallKind::Create,
                    credential: lease.id.clone(),
                    conversation_id: None,
                    turn_id: None,
                    message: Some(turn.message.clone()),
                },
            )?;
            state.conversations.insert(
                conversation_id.clone(),
                Conversation {
                    owner: lease.id.clone(),
                    last_turn_id: String::new(),
                },
            );
        }
        Ok(self.spawn_turn(&conversation_id, true, turn))
    }

    async fn append_response(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        parent_turn_id: &str,
        turn: &UpstreamTurn,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        {
            let mut state = self.state.lock();
            Self::record(
                &mut state,
                RecordedCall {
                    kind: CallKind::Append,
                    credential: lease.id.clone(),
                    conversation_id: Some(conversation_id.to_string()),
                    turn_id: Some(parent_turn_id.to_string()),
                    message: Some(turn.message.clone()),
                },
            )?;
            match state.conversations.get(conversation_id) {
                Some(conv) if conv.owner == lease.id => {}
                _ => return Err(Self::not_found("conversation", conversation_id)),
            }
        }
        Ok(self.spawn_turn(conversation_id, false, turn))
    }

    async fn create_share_link(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<String, UpstreamError> {
        if self.shares_held.load(Ordering::SeqCst) {
            match self.share_gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(UpstreamError::Unavailable("share gate closed".into())),
            }
        }
        let link = self.next_id("share");
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            RecordedCall {
                kind: CallKind::Share,
                credential: lease.id.clone(),
                conversation_id: Some(conversation_id.to_string()),
                turn_id: Some(turn_id.to_string()),
                message: None,
            },
        )?;
        if let Some(error) = state.share_failures.pop_front() {
            return Err(error);
        }
        match state.conversations.get(conversation_id) {
            Some(conv) if conv.owner == lease.id => {}
            _ => return Err(Self::not_found("conversation", conversation_id)),
        }
        state.share_links.insert(
            link.clone(),
            (conversation_id.to_string(), turn_id.to_string()),
        );
        Ok(link)
    }

    async fn clone_share_link(
        &self,
        lease: &CredentialLease,
        share_link: &str,
    ) -> Result<ClonedConversation, UpstreamError> {
        let conversation_id = self.next_id("conv");
        let turn_id = self.next_id("resp");
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            RecordedCall {
                kind: CallKind::Clone,
                credential: lease.id.clone(),
                conversation_id: None,
                turn_id: None,
                message: Some(share_link.to_string()),
            },
        )?;
        if let Some(error) = state.clone_failures.pop_front() {
            return Err(error);
        }
        if !state.share_links.contains_key(share_link) {
            return Err(Self::not_found("share link", share_link));
        }
        state.conversations.insert(
            conversation_id.clone(),
            Conversation {
                owner: lease.id.clone(),
                last_turn_id: turn_id.clone(),
            },
        );
        Ok(ClonedConversation {
            conversation_id,
            turn_id,
        })
    }

    async fn check_quota(&self, lease: &CredentialLease) -> Result<QuotaStatus, UpstreamError> {
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            RecordedCall {
                kind: CallKind::QuotaCheck,
                credential: lease.id.clone(),
                conversation_id: None,
                turn_id: None,
                message: None,
            },
        )?;
        Ok(state
            .quotas
            .get(&lease.id)
            .copied()
            .unwrap_or(QuotaStatus {
                remaining_quota: 100,
                tier: Tier::Free,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(id: &str) -> CredentialLease {
        CredentialLease {
            id: CredentialId::from(id),
            secret: format!("secret-{id}"),
            tier: Tier::Unknown,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<UpstreamEvent>) -> Vec<UpstreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_conversations_are_scoped_to_owner() {
        let upstream = ScriptedUpstream::new();
        let turn = UpstreamTurn::new("hi", "grok-3", "MODEL_MODE_AUTO");
        let events = drain(upstream.create_conversation(&lease("a"), &turn).await.unwrap()).await;
        let Some(UpstreamEvent::Conversation { conversation_id }) = events.first().cloned() else {
            panic!("expected conversation event, got {events:?}");
        };

        assert!(upstream
            .append_response(&lease("a"), &conversation_id, "x", &turn)
            .await
            .is_ok());
        let err = upstream
            .append_response(&lease("b"), &conversation_id, "x", &turn)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_share_then_clone_changes_owner() {
        let upstream = ScriptedUpstream::new();
        let turn = UpstreamTurn::new("hi", "grok-3", "MODEL_MODE_AUTO");
        let events = drain(upstream.create_conversation(&lease("a"), &turn).await.unwrap()).await;
        let Some(UpstreamEvent::Conversation { conversation_id }) = events.first().cloned() else {
            panic!("expected conversation event");
        };
        let link = upstream
            .create_share_link(&lease("a"), &conversation_id, "t")
            .await
            .unwrap();
        let cloned = upstream.clone_share_link(&lease("b"), &link).await.unwrap();
        assert_ne!(cloned.conversation_id, conversation_id);
        assert_eq!(
            upstream.owner_of(&cloned.conversation_id),
            Some(CredentialId::from("b"))
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let upstream = ScriptedUpstream::new();
        let turn = UpstreamTurn::new("hi", "grok-3", "MODEL_MODE_AUTO");
        upstream.fail_next(&CredentialId::from("a"), UpstreamError::AuthFailed("nope".into()));
        assert!(upstream.create_conversation(&lease("a"), &turn).await.is_err());
        assert!(upstream.create_conversation(&lease("a"), &turn).await.is_ok());
        assert_eq!(upstream.call_count(CallKind::Create), 2);
    }
}
