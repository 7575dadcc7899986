//! Request Orchestrator
//!
//! The outward-facing surface of the relay. Owns the credential pool, the
//! context store, the continuation driver and the statistics sink, and
//! composes them per inbound request:
//!
//! ```text
//! ChatRequest -> RequestOrchestrator -> ContinuationDriver -> FrameStream
//!                       |                                        |
//!                       |                            stream?  ---+--- buffered
//!                       v                              |               |
//!              ChatResponse::Stream            ChunkEncoder     ChatCompletion
//! ```
//!
//! # Lifecycle
//!
//! [`RequestOrchestrator::start`] restores persisted state, adds the
//! configured seed credentials and spawns the maintenance loop. The loop
//! expires sessions and sweeps cooldowns on a timer, and flushes state as
//! soon as anything is marked dirty. [`RequestOrchestrator::shutdown`] stops
//! the loop and flushes state one last time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{CredentialSeed, RelayConfig};
use crate::context::{ContextStore, ConversationSession, StoreStats};
use crate::credentials::{
    Credential, CredentialLease, CredentialPool, CredentialState, PoolError, PoolStats, Tier,
};
use crate::driver::{ContinuationDriver, FrameStream};
use crate::error::{RelayError, RequestFailure};
use crate::messages::{ChatRequest, ConversationHandle, CredentialId, TraceId};
use crate::models::ModelRegistry;
use crate::persistence::{JsonFileStore, StateStore, StateSync};
use crate::stats::{MetricsSnapshot, RelayStats, RequestRecord};
use crate::translator::{completion_id, ChatCompletion, ChunkEncoder, ModelCard, ModelList};
use crate::upstream::{GrokClient, QuotaStatus, UpstreamClient};

// ============================================================================
// Responses
// ============================================================================

/// Outcome of a chat request
#[derive(Debug)]
pub enum ChatResponse {
    /// Buffered answer
    Complete {
        /// The completion
        completion: ChatCompletion,
        /// Trace id of the request
        trace_id: TraceId,
    },
    /// Streamed answer
    Stream {
        /// Frames in order, ending with `Done` or `Error`
        frames: FrameStream,
        /// SSE encoder for those frames
        encoder: ChunkEncoder,
    },
}

impl ChatResponse {
    /// Trace id of the request
    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        match self {
            Self::Complete { trace_id, .. } => trace_id,
            Self::Stream { frames, .. } => frames.trace_id(),
        }
    }

    /// Handle to continue the conversation with
    #[must_use]
    pub fn handle(&self) -> &ConversationHandle {
        match self {
            Self::Complete { completion, .. } => &completion.conversation_id,
            Self::Stream { frames, .. } => frames.handle(),
        }
    }
}

/// Health snapshot
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// `ok` when at least one credential is Active, else `degraded`
    pub status: &'static str,
    /// Upstream client in use
    pub upstream: &'static str,
    /// Credential pool
    pub pool: PoolStats,
    /// Conversation store
    pub sessions: StoreStats,
    /// Turn counters
    pub metrics: MetricsSnapshot,
    /// Seconds since the orchestrator was built
    pub uptime_secs: u64,
}

/// Quota checks a bulk refresh runs at once
const REFRESH_CONCURRENCY: usize = 5;

/// Results kept in [`RefreshProgress::recent`]
const REFRESH_RECENT: usize = 10;

/// How one credential fared in a bulk refresh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    /// Quota and tier were read
    Refreshed,
    /// Upstream could not answer
    Failed,
    /// Disabled credentials are left alone
    Skipped,
}

/// One credential's result in a bulk refresh
#[derive(Clone, Debug, Serialize)]
pub struct RefreshResult {
    /// Credential id
    pub id: CredentialId,
    /// Operator label
    pub name: String,
    /// Outcome
    pub status: RefreshStatus,
    /// Remaining quota read
    pub remaining_quota: Option<i64>,
    /// Tier read
    pub tier: Option<Tier>,
    /// Failure detail
    pub error: Option<String>,
}

/// Live state of the bulk refresh
#[derive(Clone, Debug, Default, Serialize)]
pub struct RefreshProgress {
    /// Whether a refresh is running
    pub in_progress: bool,
    /// Credentials in the run
    pub total: usize,
    /// Credentials finished so far
    pub completed: usize,
    /// Latest results, oldest first
    pub recent: Vec<RefreshResult>,
}

/// Outcome of a bulk refresh
#[derive(Clone, Debug, Default, Serialize)]
pub struct RefreshReport {
    /// Credentials read successfully
    pub refreshed: usize,
    /// Credentials upstream could not answer for
    pub failed: usize,
    /// Disabled credentials left alone
    pub skipped: usize,
    /// Per-credential results in completion order
    pub results: Vec<RefreshResult>,
}

/// Clears the running flag however the refresh ends
struct RefreshRun<'a>(&'a AtomicBool);

impl Drop for RefreshRun<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`RequestOrchestrator`]
///
/// Anything not supplied falls back to production defaults: the HTTP
/// upstream client, the system clock and JSON files under the configured
/// data directory.
pub struct RelayBuilder {
    config: RelayConfig,
    upstream: Option<Arc<dyn UpstreamClient>>,
    clock: Option<Arc<dyn Clock>>,
    state: Option<Arc<dyn StateStore>>,
}

impl RelayBuilder {
    /// Builder over a resolved configuration
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            upstream: None,
            clock: None,
            state: None,
        }
    }

    /// Use a specific upstream client
    #[must_use]
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Use a specific clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a specific state store
    #[must_use]
    pub fn state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Wire everything together
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the configuration fails validation
    /// or the HTTP client cannot be built.
    pub fn build(self) -> Result<RequestOrchestrator, RelayError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let upstream: Arc<dyn UpstreamClient> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(
                GrokClient::new(&config.upstream)
                    .map_err(|e| RelayError::Config(format!("{e:#}")))?,
            ),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let state: Arc<dyn StateStore> = self
            .state
            .unwrap_or_else(|| Arc::new(JsonFileStore::new(config.data_dir.clone())));

        let stats = Arc::new(RelayStats::new(config.max_log_entries, Arc::clone(&clock)));
        let pool = Arc::new(CredentialPool::new(
            config.pool.clone(),
            Arc::clone(&clock),
            stats.clone(),
        ));
        let store = Arc::new(ContextStore::new(config.store.clone(), Arc::clone(&clock)));
        let sync = Arc::new(StateSync::new());
        let driver = ContinuationDriver::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&upstream),
            stats.clone(),
            Arc::clone(&sync),
            Arc::clone(&clock),
            config.driver_config(),
        );

        let started_ms = clock.now_ms();
        Ok(RequestOrchestrator {
            inner: Arc::new(Inner {
                config,
                pool,
                store,
                upstream,
                stats,
                sync,
                state,
                driver,
                clock,
                registry: ModelRegistry,
                started_ms,
                shutdown: Notify::new(),
                sweeper: Mutex::new(None),
                refreshing: AtomicBool::new(false),
                refresh_progress: Mutex::new(RefreshProgress::default()),
            }),
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Inner {
    config: RelayConfig,
    pool: Arc<CredentialPool>,
    store: Arc<ContextStore>,
    upstream: Arc<dyn UpstreamClient>,
    stats: Arc<RelayStats>,
    sync: Arc<StateSync>,
    state: Arc<dyn StateStore>,
    driver: ContinuationDriver,
    clock: Arc<dyn Clock>,
    registry: ModelRegistry,
    started_ms: u64,
    shutdown: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    refreshing: AtomicBool,
    refresh_progress: Mutex<RefreshProgress>,
}

impl Inner {
    /// One maintenance pass
    async fn maintain(&self) {
        let evicted = self.store.evict_expired();
        if evicted > 0 {
            self.sync.mark_sessions();
        }
        let reactivated = self.pool.sweep();
        if reactivated > 0 {
            self.sync.mark_credentials();
        }
        if self.sync.is_dirty() {
            self.flush().await;
        }
        tracing::trace!(evicted, reactivated, "Maintenance pass complete");
    }

    /// Write whatever is dirty
    async fn flush(&self) -> bool {
        self.sync
            .flush(&self.pool, &self.store, self.stats.log(), self.state.as_ref())
            .await
    }

    /// Record a quota reading; `false` if the credential is gone
    fn record_quota(&self, id: &CredentialId, status: &QuotaStatus) -> bool {
        let recorded = self
            .pool
            .update_quota(id, status.remaining_quota)
            .and_then(|()| {
                if status.tier == Tier::Unknown {
                    Ok(())
                } else {
                    self.pool.set_tier(id, status.tier)
                }
            });
        if recorded.is_ok() {
            self.sync.mark_credentials();
        }
        recorded.is_ok()
    }

    /// Read one credential's quota and tier for a bulk refresh
    async fn refresh_one(&self, cred: Credential) -> RefreshResult {
        let lease = CredentialLease {
            id: cred.id.clone(),
            secret: cred.secret,
            tier: cred.tier,
        };
        let mut result = RefreshResult {
            id: cred.id,
            name: cred.name,
            status: RefreshStatus::Failed,
            remaining_quota: None,
            tier: None,
            error: None,
        };
        match self.upstream.check_quota(&lease).await {
            Ok(status) => {
                if self.record_quota(&result.id, &status) {
                    result.status = RefreshStatus::Refreshed;
                    result.remaining_quota = Some(status.remaining_quota);
                    result.tier = Some(status.tier);
                } else {
                    result.error = Some("credential removed during refresh".into());
                }
            }
            Err(e) => {
                tracing::debug!(credential = %result.id, error = %e, "Quota refresh failed");
                result.error = Some(e.to_string());
            }
        }
        result
    }

    fn refresh_finished_one(&self, report: &mut RefreshReport, result: RefreshResult) {
        match result.status {
            RefreshStatus::Refreshed => report.refreshed += 1,
            RefreshStatus::Failed => report.failed += 1,
            RefreshStatus::Skipped => report.skipped += 1,
        }
        {
            let mut progress = self.refresh_progress.lock();
            progress.completed += 1;
            progress.recent.push(result.clone());
            if progress.recent.len() > REFRESH_RECENT {
                progress.recent.remove(0);
            }
        }
        report.results.push(result);
    }
}

/// Entry point for chat requests and operator actions
#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    /// Builder over a resolved configuration
    #[must_use]
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Restore persisted state, add seed credentials and start maintenance
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Persistence`] if persisted state exists but
    /// cannot be read.
    pub async fn start(&self) -> Result<(), RelayError> {
        let inner = &self.inner;

        let credentials = inner
            .state
            .load_credentials()
            .await
            .map_err(|e| RelayError::Persistence(e.to_string()))?;
        let sessions = inner
            .state
            .load_sessions()
            .await
            .map_err(|e| RelayError::Persistence(e.to_string()))?;

        let requests = match inner.state.load_request_log().await {
            Ok(requests) => requests,
            Err(e) => {
                tracing::warn!(error = %e, "Request log unreadable, starting empty");
                Vec::new()
            }
        };

        let restored_credentials = credentials.len();
        inner.pool.restore(credentials);
        let restored_sessions = inner.store.restore(sessions);
        inner.stats.log().restore(requests);
        let seeded = self.add_seeds(&inner.config.credentials);

        tracing::info!(
            credentials = inner.pool.len(),
            restored_credentials,
            seeded,
            sessions = restored_sessions,
            requests = inner.stats.log().len(),
            upstream = inner.upstream.name(),
            "Relay started"
        );

        let mut sweeper = inner.sweeper.lock();
        if sweeper.is_none() {
            let task_inner = Arc::clone(inner);
            *sweeper = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(task_inner.config.sweep_interval);
                // First tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = task_inner.shutdown.notified() => break,
                        _ = ticker.tick() => task_inner.maintain().await,
                        () = task_inner.sync.changed() => {
                            task_inner.flush().await;
                        }
                    }
                }
                tracing::debug!("Maintenance loop stopped");
            }));
        }
        Ok(())
    }

    /// Stop maintenance and flush state
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let sweeper = inner.sweeper.lock().take();
        if let Some(handle) = sweeper {
            inner.shutdown.notify_one();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Maintenance loop ended abnormally");
            }
        }
        inner.sync.mark_credentials();
        inner.sync.mark_sessions();
        inner.sync.mark_requests();
        if inner.flush().await {
            tracing::info!("Relay state flushed");
        }
    }

    /// Run one maintenance pass now
    pub async fn maintain(&self) {
        self.inner.maintain().await;
    }

    // ------------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------------

    /// Answer a chat request, continuing a known conversation if one matches
    ///
    /// # Errors
    ///
    /// Returns a [`RequestFailure`] carrying the request's trace id. For
    /// streamed requests only failures before the first frame surface here;
    /// later ones arrive as a terminal `Error` frame.
    pub async fn chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, RequestFailure> {
        let trace_id = TraceId::new();
        tracing::debug!(
            trace_id = %trace_id,
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            handle = ?request.conversation_id,
            "Chat request"
        );

        if request.messages.is_empty() {
            return Err(RequestFailure::new(
                trace_id,
                RelayError::InvalidRequest("messages must not be empty".into()),
            ));
        }

        let mut frames = self
            .inner
            .driver
            .run_turn(&request, trace_id.clone())
            .await
            .map_err(|e| RequestFailure::new(trace_id.clone(), e))?;

        let created = self.created_secs();
        if request.stream {
            let encoder = ChunkEncoder::new(
                request.model,
                created,
                frames.handle().clone(),
                trace_id,
            );
            return Ok(ChatResponse::Stream { frames, encoder });
        }

        let content = frames
            .collect_text()
            .await
            .map_err(|e| RequestFailure::new(trace_id.clone(), e))?;
        let completion = ChatCompletion::new(
            completion_id(),
            request.model,
            created,
            frames.handle().clone(),
            content,
        );
        Ok(ChatResponse::Complete {
            completion,
            trace_id,
        })
    }

    /// Continue an existing conversation by handle
    ///
    /// # Errors
    ///
    /// As [`Self::chat_completion`], plus `missing_conversation_id` when the
    /// request carries no handle.
    pub async fn continue_conversation(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, RequestFailure> {
        if request.conversation_id.is_none() {
            return Err(RequestFailure::new(
                TraceId::new(),
                RelayError::MissingConversationId,
            ));
        }
        self.chat_completion(request).await
    }

    /// Forget a conversation
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionNotFound`] for an unknown handle.
    pub async fn delete_conversation(
        &self,
        handle: &ConversationHandle,
    ) -> Result<ConversationSession, RelayError> {
        // Wait out any turn in flight on this handle
        let _guard = self.inner.store.acquire(handle).await;
        let session = self
            .inner
            .store
            .remove(handle)
            .ok_or_else(|| RelayError::SessionNotFound(handle.clone()))?;
        self.inner.sync.mark_sessions();
        tracing::info!(handle = %handle, credential = %session.credential, "Conversation deleted");
        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------------

    /// Registered models
    #[must_use]
    pub fn list_models(&self) -> ModelList {
        let created = self.created_secs();
        ModelList::new(
            self.inner
                .registry
                .all()
                .iter()
                .map(|spec| ModelRegistry::card(spec, created))
                .collect(),
        )
    }

    /// One registered model, by id or alias
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ModelNotFound`] for an unregistered id.
    pub fn get_model(&self, id: &str) -> Result<ModelCard, RelayError> {
        self.inner
            .registry
            .get(id)
            .map(|spec| ModelRegistry::card(spec, self.created_secs()))
            .ok_or_else(|| RelayError::ModelNotFound(id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------------

    /// Add one credential
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::EmptySecret`] or [`PoolError::Duplicate`].
    pub fn add_credential(
        &self,
        secret: &str,
        name: &str,
        tier: Tier,
    ) -> Result<CredentialId, PoolError> {
        let id = self.inner.pool.add(secret, name, tier)?;
        self.inner.sync.mark_credentials();
        Ok(id)
    }

    /// Add seed credentials, skipping ones already present
    ///
    /// Returns how many were added.
    pub fn add_seeds(&self, seeds: &[CredentialSeed]) -> usize {
        let mut added = 0;
        for seed in seeds {
            match self.inner.pool.add(&seed.secret, &seed.name, seed.tier) {
                Ok(_) => added += 1,
                Err(PoolError::Duplicate(id)) => {
                    tracing::debug!(credential = %id, "Seed credential already present");
                }
                Err(e) => tracing::warn!(name = %seed.name, error = %e, "Skipping seed credential"),
            }
        }
        if added > 0 {
            self.inner.sync.mark_credentials();
        }
        added
    }

    /// Remove a credential; its conversations migrate on their next turn
    pub fn remove_credential(&self, id: &CredentialId) -> bool {
        let removed = self.inner.pool.remove(id);
        if removed {
            self.inner.sync.mark_credentials();
        }
        removed
    }

    /// Enable or disable a credential
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown id.
    pub fn set_credential_enabled(&self, id: &CredentialId, enabled: bool) -> Result<(), PoolError> {
        self.inner.pool.set_enabled(id, enabled)?;
        self.inner.sync.mark_credentials();
        Ok(())
    }

    /// Ask upstream for a credential's remaining quota and tier
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRequest`] for an unknown id, or the
    /// mapped upstream failure.
    pub async fn check_credential(&self, id: &CredentialId) -> Result<QuotaStatus, RelayError> {
        let inner = &self.inner;
        let lease = inner
            .pool
            .lease(id)
            .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
        let status = inner
            .upstream
            .check_quota(&lease)
            .await
            .map_err(|e| RelayError::from_upstream(id, e))?;

        // The credential may have been removed while the check ran
        inner.record_quota(id, &status);
        tracing::info!(
            credential = %id,
            remaining = status.remaining_quota,
            tier = %status.tier,
            "Credential quota checked"
        );
        Ok(status)
    }

    /// Re-read quota and tier for every enabled credential
    ///
    /// Runs up to five checks at once; disabled credentials are skipped.
    /// Progress is visible through [`Self::refresh_progress`] while it runs.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRequest`] if a refresh is already running.
    pub async fn refresh_all_credentials(&self) -> Result<RefreshReport, RelayError> {
        let inner = &self.inner;
        if inner.refreshing.swap(true, Ordering::AcqRel) {
            return Err(RelayError::InvalidRequest(
                "a credential refresh is already running".into(),
            ));
        }
        let _run = RefreshRun(&inner.refreshing);

        let now = inner.clock.now_ms();
        let (disabled, enabled): (Vec<Credential>, Vec<Credential>) = inner
            .pool
            .snapshot()
            .into_iter()
            .partition(|c| c.effective_state(now) == CredentialState::Disabled);
        *inner.refresh_progress.lock() = RefreshProgress {
            in_progress: true,
            total: disabled.len() + enabled.len(),
            ..RefreshProgress::default()
        };
        tracing::info!(
            enabled = enabled.len(),
            disabled = disabled.len(),
            "Credential refresh started"
        );

        let mut report = RefreshReport::default();
        for cred in disabled {
            let result = RefreshResult {
                id: cred.id,
                name: cred.name,
                status: RefreshStatus::Skipped,
                remaining_quota: None,
                tier: None,
                error: None,
            };
            inner.refresh_finished_one(&mut report, result);
        }

        let mut results = stream::iter(enabled)
            .map(|cred| inner.refresh_one(cred))
            .buffer_unordered(REFRESH_CONCURRENCY);
        while let Some(result) = results.next().await {
            inner.refresh_finished_one(&mut report, result);
        }

        inner.refresh_progress.lock().in_progress = false;
        tracing::info!(
            refreshed = report.refreshed,
            failed = report.failed,
            skipped = report.skipped,
            "Credential refresh finished"
        );
        Ok(report)
    }

    /// Progress of the current (or last) bulk refresh
    #[must_use]
    pub fn refresh_progress(&self) -> RefreshProgress {
        self.inner.refresh_progress.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Status snapshot
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let pool = inner.pool.stats();
        let uptime_ms = inner.clock.now_ms().saturating_sub(inner.started_ms);
        HealthReport {
            status: if pool.active > 0 { "ok" } else { "degraded" },
            upstream: inner.upstream.name(),
            pool,
            sessions: inner.store.stats(),
            metrics: inner.stats.metrics().snapshot(),
            uptime_secs: uptime_ms / 1000,
        }
    }

    /// Most recent request log entries, newest first
    #[must_use]
    pub fn recent_requests(&self, limit: usize) -> Vec<RequestRecord> {
        self.inner.stats.log().recent(limit)
    }

    /// Resolved configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Credential pool
    #[must_use]
    pub fn pool(&self) -> &CredentialPool {
        &self.inner.pool
    }

    /// Conversation store
    #[must_use]
    pub fn store(&self) -> &ContextStore {
        &self.inner.store
    }

    /// Statistics sink
    #[must_use]
    pub fn stats(&self) -> &RelayStats {
        &self.inner.stats
    }

    fn created_secs(&self) -> i64 {
        i64::try_from(self.inner.clock.now_ms() / 1000).unwrap_or(i64::MAX)
    }
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("upstream", &self.inner.upstream.name())
            .field("pool", &self.inner.pool)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::messages::ChatMessage;
    use crate::persistence::MemoryStore;
    use crate::translator::StreamFrame;
    use crate::upstream::ScriptedUpstream;

    fn relay_with(config: RelayConfig) -> (RequestOrchestrator, Arc<ScriptedUpstream>, Arc<MemoryStore>) {
        let upstream = Arc::new(ScriptedUpstream::new());
        let state = Arc::new(MemoryStore::new());
        let relay = RequestOrchestrator::builder(config)
            .upstream(upstream.clone())
            .clock(Arc::new(ManualClock::default()))
            .state_store(state.clone())
            .build()
            .unwrap();
        (relay, upstream, state)
    }

    fn seeded_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.credentials.push(CredentialSeed {
            secret: "secret-aaaaaaaaaaaa".into(),
            name: "a".into(),
            tier: Tier::Free,
        });
        config
    }

    #[tokio::test]
    async fn test_start_adds_seeds_once() {
        let (relay, _, _) = relay_with(seeded_config());
        relay.start().await.unwrap();
        assert_eq!(relay.pool().len(), 1);
        assert_eq!(relay.add_seeds(&relay.config().credentials.clone()), 0);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffered_completion_carries_handle() {
        let (relay, _, _) = relay_with(seeded_config());
        relay.start().await.unwrap();

        let response = relay
            .chat_completion(ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        match &response {
            ChatResponse::Complete { completion, .. } => {
                assert_eq!(completion.content(), "answer to: hi");
                assert_eq!(completion.model, "grok-3");
                assert!(relay.store().lookup_by_handle(&completion.conversation_id).is_some());
            }
            ChatResponse::Stream { .. } => panic!("expected a buffered answer"),
        }
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_streamed_completion_encodes_sse() {
        let (relay, _, _) = relay_with(seeded_config());
        relay.start().await.unwrap();

        let response = relay
            .chat_completion(
                ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]).with_stream(true),
            )
            .await
            .unwrap();
        let ChatResponse::Stream {
            mut frames,
            mut encoder,
        } = response
        else {
            panic!("expected a stream");
        };

        let mut sse = String::new();
        while let Some(frame) = frames.recv().await {
            let terminal = frame.is_terminal();
            if let Some(chunk) = encoder.encode(&frame) {
                sse.push_str(&chunk);
            }
            if terminal {
                assert!(matches!(frame, StreamFrame::Done));
                break;
            }
        }
        assert!(sse.contains("answer to: hi"));
        assert!(sse.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_continue_requires_handle() {
        let (relay, upstream, _) = relay_with(seeded_config());
        let failure = relay
            .continue_conversation(ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert_eq!(failure.error.code(), "missing_conversation_id");
        assert_eq!(failure.body().trace_id, failure.trace_id);
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let (relay, _, _) = relay_with(seeded_config());
        let failure = relay
            .chat_completion(ChatRequest::new("grok-3", Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(failure.error.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_handle_is_session_not_found() {
        let (relay, _, _) = relay_with(seeded_config());
        relay.start().await.unwrap();
        let failure = relay
            .continue_conversation(
                ChatRequest::new("grok-3", vec![ChatMessage::user("hi")])
                    .with_conversation(ConversationHandle::from("conv-missing")),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.error.code(), "session_not_found");
        relay.shutdown().await;
    }

    #[test]
    fn test_models() {
        let (relay, _, _) = relay_with(RelayConfig::default());
        let list = relay.list_models();
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 6);
        assert!(list.data.iter().all(|m| m.owned_by == "xai"));

        assert_eq!(relay.get_model("grok-420").unwrap().id, "grok-4.2");
        assert_eq!(
            relay.get_model("gpt-4").unwrap_err().code(),
            "model_not_found"
        );
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let (relay, _, _) = relay_with(seeded_config());
        relay.start().await.unwrap();
        let response = relay
            .chat_completion(ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        let handle = response.handle().clone();

        relay.delete_conversation(&handle).await.unwrap();
        assert!(relay.store().lookup_by_handle(&handle).is_none());
        assert!(matches!(
            relay.delete_conversation(&handle).await,
            Err(RelayError::SessionNotFound(_))
        ));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_check_credential_updates_pool() {
        let (relay, upstream, _) = relay_with(seeded_config());
        relay.start().await.unwrap();
        let id = relay.pool().snapshot()[0].id.clone();
        upstream.set_quota_status(
            &id,
            QuotaStatus {
                remaining_quota: 42,
                tier: Tier::Super,
            },
        );

        let status = relay.check_credential(&id).await.unwrap();
        assert_eq!(status.remaining_quota, 42);
        let cred = relay.pool().get(&id).unwrap();
        assert_eq!(cred.remaining_quota, 42);
        assert_eq!(cred.tier, Tier::Super);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reports_pool_and_sessions() {
        let (relay, _, _) = relay_with(RelayConfig::default());
        let health = relay.health();
        assert_eq!(health.status, "degraded");
        assert_eq!(health.pool.total, 0);
        assert_eq!(health.upstream, "Scripted");

        let (relay, _, _) = relay_with(seeded_config());
        relay.start().await.unwrap();
        relay
            .chat_completion(ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        let health = relay.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.sessions.sessions, 1);
        assert_eq!(health.metrics.successes, 1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_persists_state() {
        let (relay, _, state) = relay_with(seeded_config());
        relay.start().await.unwrap();
        relay
            .chat_completion(ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        relay.shutdown().await;

        assert_eq!(state.load_credentials().await.unwrap().len(), 1);
        assert_eq!(state.load_sessions().await.unwrap().len(), 1);

        // A fresh relay over the same state picks the conversation back up
        let upstream = Arc::new(ScriptedUpstream::new());
        let restarted = RequestOrchestrator::builder(RelayConfig::default())
            .upstream(upstream)
            .clock(Arc::new(ManualClock::default()))
            .state_store(state)
            .build()
            .unwrap();
        restarted.start().await.unwrap();
        assert_eq!(restarted.pool().len(), 1);
        assert_eq!(restarted.store().len(), 1);
        restarted.shutdown().await;
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_mutations_persist_without_waiting_for_sweep() {
        let (relay, _, state) = relay_with(seeded_config());
        relay.start().await.unwrap();
        relay
            .chat_completion(ChatRequest::new("grok-3", vec![ChatMessage::user("hi")]))
            .await
            .unwrap();

        // The sweep interval is a minute; these must land well before it
        assert!(eventually(|| async { state.load_sessions().await.unwrap().len() == 1 }).await);
        assert!(eventually(|| async { state.load_request_log().await.unwrap().len() == 1 }).await);

        relay
            .add_credential("secret-bbbbbbbbbbbb", "b", Tier::Free)
            .unwrap();
        assert!(eventually(|| async { state.load_credentials().await.unwrap().len() == 2 }).await);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_log_survives_restart() {
        let (relay, _, state) = relay_with(seeded_config());
        relay.start().await.unwrap();
        for message in ["one", "two"] {
            relay
                .chat_completion(ChatRequest::new("grok-3", vec![ChatMessage::user(message)]))
                .await
                .unwrap();
        }
        relay.shutdown().await;

        let restarted = RequestOrchestrator::builder(RelayConfig::default())
            .upstream(Arc::new(ScriptedUpstream::new()))
            .clock(Arc::new(ManualClock::default()))
            .state_store(state)
            .build()
            .unwrap();
        restarted.start().await.unwrap();
        let recent = restarted.recent_requests(10);
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|r| r.model == "grok-3"));
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_all_credentials() {
        let (relay, upstream, _) = relay_with(seeded_config());
        relay.start().await.unwrap();
        let seeded = relay.pool().snapshot()[0].id.clone();
        let broken = relay
            .add_credential("secret-bbbbbbbbbbbb", "b", Tier::Free)
            .unwrap();
        let parked = relay
            .add_credential("secret-cccccccccccc", "c", Tier::Free)
            .unwrap();
        relay.set_credential_enabled(&parked, false).unwrap();
        upstream.set_quota_status(
            &seeded,
            QuotaStatus {
                remaining_quota: 80,
                tier: Tier::Super,
            },
        );
        upstream.fail_always(
            &broken,
            crate::upstream::UpstreamError::Unavailable("HTTP 503".into()),
        );

        let report = relay.refresh_all_credentials().await.unwrap();
        assert_eq!((report.refreshed, report.failed, report.skipped), (1, 1, 1));
        let by_id = |id: &CredentialId| report.results.iter().find(|r| r.id == *id).unwrap();
        assert_eq!(by_id(&seeded).remaining_quota, Some(80));
        assert!(by_id(&broken).error.is_some());
        assert_eq!(by_id(&parked).status, RefreshStatus::Skipped);

        let cred = relay.pool().get(&seeded).unwrap();
        assert_eq!(cred.remaining_quota, 80);
        assert_eq!(cred.tier, Tier::Super);
        assert_eq!(
            relay.pool().get(&broken).unwrap().state,
            CredentialState::Active
        );
        assert_eq!(upstream.call_count(crate::upstream::CallKind::QuotaCheck), 2);

        let progress = relay.refresh_progress();
        assert!(!progress.in_progress);
        assert_eq!((progress.total, progress.completed), (3, 3));
        assert_eq!(progress.recent.len(), 3);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_rejects_overlapping_run() {
        let (relay, _, _) = relay_with(seeded_config());
        relay.inner.refreshing.store(true, Ordering::Release);
        let err = relay.refresh_all_credentials().await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        relay.inner.refreshing.store(false, Ordering::Release);
        let report = relay.refresh_all_credentials().await.unwrap();
        assert_eq!(report.results.len(), 0);
        assert!(!relay.inner.refreshing.load(Ordering::Acquire));
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let mut config = RelayConfig::default();
        config.store.max_per_credential = 0;
        let err = RequestOrchestrator::builder(config)
            .upstream(Arc::new(ScriptedUpstream::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}
