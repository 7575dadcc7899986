//! Conversation Context Store
//!
//! Maps external handles (and content fingerprints) to cached upstream
//! session state.
//!
//! # Indexes
//!
//! - `sessions`: handle -> session, the source of truth
//! - `fingerprints`: fingerprint -> handle, pointing at the latest fingerprint
//!   of each session; superseded entries stay until a sweep drops them, and
//!   lookups ignore them because the session's own fingerprint no longer
//!   matches
//! - `by_credential`: credential -> handles it owns, for capacity enforcement
//!
//! # Single-flight
//!
//! [`ContextStore::acquire`] hands out a per-handle async lock. The caller
//! holds it across the whole upstream turn, so two requests for the same
//! conversation never race upstream while unrelated conversations proceed in
//! parallel. Lock entries are pruned once nobody holds or awaits them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::fingerprint::Fingerprint;
use super::session::ConversationSession;
use crate::clock::{duration_ms, Clock};
use crate::messages::{ConversationHandle, CredentialId};

/// Store limits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Idle time after which a session is purged
    pub ttl: Duration,
    /// Live sessions allowed per credential
    pub max_per_credential: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(72_000),
            max_per_credential: 100,
        }
    }
}

/// Exclusive right to run a turn on one handle
#[derive(Debug)]
pub struct HandleGuard {
    handle: ConversationHandle,
    contended: bool,
    _guard: OwnedMutexGuard<()>,
}

impl HandleGuard {
    /// Handle this guard protects
    #[must_use]
    pub fn handle(&self) -> &ConversationHandle {
        &self.handle
    }

    /// Whether another turn held the handle when this one asked for it
    #[must_use]
    pub fn was_contended(&self) -> bool {
        self.contended
    }
}

/// Store statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Live sessions
    pub sessions: usize,
    /// Fingerprint index entries (including superseded ones)
    pub fingerprints: usize,
    /// Credentials owning at least one session
    pub credentials: usize,
    /// Handles with a lock entry
    pub locks: usize,
}

/// Shared store of conversation sessions
pub struct ContextStore {
    sessions: DashMap<ConversationHandle, ConversationSession>,
    fingerprints: DashMap<Fingerprint, ConversationHandle>,
    by_credential: DashMap<CredentialId, HashSet<ConversationHandle>>,
    locks: DashMap<ConversationHandle, Arc<Mutex<()>>>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl ContextStore {
    /// Create an empty store
    #[must_use]
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            fingerprints: DashMap::new(),
            by_credential: DashMap::new(),
            locks: DashMap::new(),
            config,
            clock,
        }
    }

    /// Limits in effect
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of sessions (expired ones included until swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn ttl_ms(&self) -> u64 {
        duration_ms(self.config.ttl)
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Session for a handle; expired sessions are purged and reported missing
    #[must_use]
    pub fn lookup_by_handle(&self, handle: &ConversationHandle) -> Option<ConversationSession> {
        let now = self.clock.now_ms();
        let ttl = self.ttl_ms();
        {
            let session = self.sessions.get(handle)?;
            if !session.is_expired(now, ttl) {
                return Some(session.clone());
            }
        }
        tracing::debug!(handle = %handle, "Session expired on access");
        self.remove(handle);
        None
    }

    /// Session whose latest fingerprint is `fingerprint`
    #[must_use]
    pub fn lookup_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<ConversationSession> {
        let handle = self.fingerprints.get(fingerprint).map(|h| h.value().clone())?;
        match self.lookup_by_handle(&handle) {
            Some(session) if session.fingerprint.as_ref() == Some(fingerprint) => Some(session),
            _ => None,
        }
    }

    /// Sessions owned by a credential
    #[must_use]
    pub fn sessions_for(&self, credential: &CredentialId) -> Vec<ConversationHandle> {
        let mut handles: Vec<ConversationHandle> = self
            .by_credential
            .get(credential)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        handles.sort();
        handles
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Create or replace the session for its handle
    ///
    /// Points the fingerprint index at the session's current fingerprint and
    /// enforces the owner's capacity. Returns the handles evicted to make room.
    pub fn upsert(&self, session: ConversationSession) -> Vec<ConversationHandle> {
        let handle = session.handle.clone();
        let owner = session.credential.clone();
        let fingerprint = session.fingerprint.clone();

        let previous_owner = self
            .sessions
            .insert(handle.clone(), session)
            .map(|old| old.credential);

        if let Some(previous) = previous_owner.filter(|p| *p != owner) {
            if let Some(mut set) = self.by_credential.get_mut(&previous) {
                set.remove(&handle);
            }
            tracing::debug!(handle = %handle, from = %previous, to = %owner, "Session changed owner");
        }
        self.by_credential
            .entry(owner.clone())
            .or_default()
            .insert(handle.clone());

        if let Some(fp) = fingerprint {
            self.fingerprints.insert(fp, handle);
        }

        self.enforce_capacity(&owner)
    }

    /// Evict least-recently-used sessions of `credential` until it is within
    /// its cap. Returns the evicted handles.
    pub fn enforce_capacity(&self, credential: &CredentialId) -> Vec<ConversationHandle> {
        let mut evicted = Vec::new();
        {
            let Some(mut owned) = self.by_credential.get_mut(credential) else {
                return evicted;
            };
            owned.retain(|h| {
                self.sessions
                    .get(h)
                    .is_some_and(|s| s.credential == *credential)
            });
            if owned.len() <= self.config.max_per_credential {
                return evicted;
            }

            let mut by_age: Vec<(u64, u64, ConversationHandle)> = owned
                .iter()
                .filter_map(|h| {
                    self.sessions
                        .get(h)
                        .map(|s| (s.last_used_ms, s.created_ms, h.clone()))
                })
                .collect();
            by_age.sort();

            let excess = owned.len() - self.config.max_per_credential;
            for (_, _, handle) in by_age.into_iter().take(excess) {
                owned.remove(&handle);
                evicted.push(handle);
            }
        }

        for handle in &evicted {
            self.sessions.remove(handle);
            tracing::info!(handle = %handle, credential = %credential, "Session evicted for capacity");
        }
        evicted
    }

    /// Remove a session explicitly
    pub fn remove(&self, handle: &ConversationHandle) -> Option<ConversationSession> {
        let (_, session) = self.sessions.remove(handle)?;
        if let Some(mut owned) = self.by_credential.get_mut(&session.credential) {
            owned.remove(handle);
        }
        if let Some(fp) = &session.fingerprint {
            self.fingerprints.remove_if(fp, |_, h| h == handle);
        }
        Some(session)
    }

    /// Purge expired sessions, superseded fingerprints and idle locks
    ///
    /// Returns the number of sessions removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.ttl_ms();

        let expired: Vec<ConversationHandle> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now, ttl))
            .map(|s| s.key().clone())
            .collect();
        for handle in &expired {
            self.remove(handle);
        }

        self.fingerprints.retain(|fp, handle| {
            self.sessions
                .get(handle)
                .is_some_and(|s| s.fingerprint.as_ref() == Some(fp))
        });
        self.by_credential.retain(|_, owned| !owned.is_empty());
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired sessions purged");
        }
        expired.len()
    }

    // ------------------------------------------------------------------------
    // Single-flight
    // ------------------------------------------------------------------------

    /// Wait for exclusive use of a handle
    pub async fn acquire(&self, handle: &ConversationHandle) -> HandleGuard {
        let lock = Arc::clone(
            self.locks
                .entry(handle.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let (guard, contended) = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => {
                tracing::debug!(handle = %handle, "Waiting for in-flight turn");
                (lock.lock_owned().await, true)
            }
        };
        HandleGuard {
            handle: handle.clone(),
            contended,
            _guard: guard,
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Copies of all live sessions, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConversationSession> {
        let now = self.clock.now_ms();
        let ttl = self.ttl_ms();
        let mut all: Vec<ConversationSession> = self
            .sessions
            .iter()
            .filter(|s| !s.is_expired(now, ttl))
            .map(|s| s.value().clone())
            .collect();
        all.sort_by_key(|s| (s.created_ms, s.handle.clone()));
        all
    }

    /// Load persisted sessions, skipping expired ones
    ///
    /// Returns the number of sessions restored.
    pub fn restore(&self, sessions: Vec<ConversationSession>) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.ttl_ms();
        let mut restored = 0;
        for session in sessions {
            if session.is_expired(now, ttl) {
                continue;
            }
            self.upsert(session);
            restored += 1;
        }
        restored
    }

    /// Index sizes
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            sessions: self.sessions.len(),
            fingerprints: self.fingerprints.len(),
            credentials: self.by_credential.iter().filter(|e| !e.is_empty()).count(),
            locks: self.locks.len(),
        }
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::fingerprint::{lookup_fingerprint, storage_fingerprint};
    use crate::messages::ChatMessage;
    use tokio_test::{assert_pending, assert_ready, task};

    fn new_store(max: usize) -> (Arc<ManualClock>, ContextStore) {
        let clock = Arc::new(ManualClock::default());
        let store = ContextStore::new(
            StoreConfig {
                ttl: Duration::from_secs(600),
                max_per_credential: max,
            },
            clock.clone(),
        );
        (clock, store)
    }

    fn session(clock: &ManualClock, handle: &str, owner: &str) -> ConversationSession {
        ConversationSession::new(
            ConversationHandle::from(handle),
            format!("up-{handle}"),
            "turn-1",
            CredentialId::from(owner),
            clock.now_ms(),
        )
    }

    #[test]
    fn test_upsert_and_lookup() {
        let (clock, store) = new_store(10);
        let mut s = session(&clock, "h1", "c1");
        let turn1 = vec![ChatMessage::system("sys"), ChatMessage::user("u1")];
        s.fingerprint = storage_fingerprint(&turn1);
        store.upsert(s.clone());

        assert_eq!(store.lookup_by_handle(&s.handle), Some(s.clone()));

        let turn2 = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("u1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("u2"),
        ];
        let fp = lookup_fingerprint(&turn2).unwrap();
        assert_eq!(store.lookup_by_fingerprint(&fp).map(|s| s.handle), Some(s.handle));
    }

    #[test]
    fn test_superseded_fingerprint_misses() {
        let (clock, store) = new_store(10);
        let mut s = session(&clock, "h1", "c1");
        let old = Fingerprint("old".into());
        let new = Fingerprint("new".into());

        s.fingerprint = Some(old.clone());
        store.upsert(s.clone());
        s.fingerprint = Some(new.clone());
        store.upsert(s);

        assert!(store.lookup_by_fingerprint(&old).is_none());
        assert!(store.lookup_by_fingerprint(&new).is_some());
        // Superseded entry lingers until a sweep
        assert_eq!(store.stats().fingerprints, 2);
        store.evict_expired();
        assert_eq!(store.stats().fingerprints, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let (clock, store) = new_store(10);
        let mut s = session(&clock, "h1", "c1");
        s.fingerprint = Some(Fingerprint("fp".into()));
        store.upsert(s.clone());

        clock.advance(Duration::from_secs(600));
        assert!(store.lookup_by_handle(&s.handle).is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.lookup_by_fingerprint(&Fingerprint("fp".into())).is_none());
        assert!(store.lookup_by_handle(&s.handle).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_evict_expired_sweeps() {
        let (clock, store) = new_store(10);
        store.upsert(session(&clock, "old", "c1"));
        clock.advance(Duration::from_secs(500));
        store.upsert(session(&clock, "fresh", "c1"));
        clock.advance(Duration::from_secs(200));

        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.sessions_for(&CredentialId::from("c1")),
            vec![ConversationHandle::from("fresh")]
        );
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let (clock, store) = new_store(2);
        let mut a = session(&clock, "a", "c1");
        store.upsert(a.clone());
        clock.advance(Duration::from_secs(1));
        store.upsert(session(&clock, "b", "c1"));
        clock.advance(Duration::from_secs(1));

        // Touch `a` so `b` becomes least recently used
        a.last_used_ms = clock.now_ms();
        store.upsert(a);
        clock.advance(Duration::from_secs(1));

        let evicted = store.upsert(session(&clock, "c", "c1"));
        assert_eq!(evicted, vec![ConversationHandle::from("b")]);
        assert_eq!(store.len(), 2);

        // Other credentials are unaffected
        assert!(store.upsert(session(&clock, "d", "c2")).is_empty());
    }

    #[test]
    fn test_owner_change_moves_capacity_accounting() {
        let (clock, store) = new_store(1);
        let mut s = session(&clock, "h", "c1");
        store.upsert(s.clone());

        s.credential = CredentialId::from("c2");
        assert!(store.upsert(s).is_empty());
        assert!(store.sessions_for(&CredentialId::from("c1")).is_empty());

        // c1 has room again
        assert!(store.upsert(session(&clock, "h2", "c1")).is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove() {
        let (clock, store) = new_store(10);
        let mut s = session(&clock, "h", "c1");
        s.fingerprint = Some(Fingerprint("fp".into()));
        store.upsert(s.clone());

        assert!(store.remove(&s.handle).is_some());
        assert!(store.remove(&s.handle).is_none());
        assert_eq!(store.stats().fingerprints, 0);
    }

    #[test]
    fn test_snapshot_restore_skips_expired() {
        let (clock, store) = new_store(10);
        store.upsert(session(&clock, "a", "c1"));
        store.upsert(session(&clock, "b", "c2"));
        let saved = store.snapshot();
        assert_eq!(saved.len(), 2);

        let (clock2, restored) = new_store(10);
        clock2.set(clock.now_ms() + 601_000);
        assert_eq!(restored.restore(saved.clone()), 0);

        clock2.set(clock.now_ms());
        assert_eq!(restored.restore(saved), 2);
    }

    #[tokio::test]
    async fn test_acquire_reports_contention() {
        let (_, store) = new_store(10);
        let store = Arc::new(store);
        let handle = ConversationHandle::from("h");

        let first = store.acquire(&handle).await;
        assert!(!first.was_contended());

        let waiter = {
            let store = Arc::clone(&store);
            let handle = handle.clone();
            tokio::spawn(async move { store.acquire(&handle).await.was_contended() })
        };
        tokio::task::yield_now().await;
        drop(first);

        assert!(waiter.await.unwrap());

        // Lock entry is pruned once idle
        store.evict_expired();
        assert_eq!(store.stats().locks, 0);
    }

    #[tokio::test]
    async fn test_waiter_stays_pending_until_release() {
        let (_, store) = new_store(10);
        let handle = ConversationHandle::from("h");
        let first = store.acquire(&handle).await;

        let mut waiter = task::spawn(store.acquire(&handle));
        assert_pending!(waiter.poll());

        drop(first);
        assert!(waiter.is_woken());
        let guard = assert_ready!(waiter.poll());
        assert!(guard.was_contended());
    }

    #[tokio::test]
    async fn test_unrelated_handles_do_not_block() {
        let (_, store) = new_store(10);
        let _a = store.acquire(&ConversationHandle::from("a")).await;
        let b = store.acquire(&ConversationHandle::from("b")).await;
        assert!(!b.was_contended());
    }
}
