//! Continuation Driver
//!
//! Runs one chat turn: decides how the turn continues upstream, starts the
//! upstream call, pumps translated frames to the caller and records the
//! outcome.
//!
//! # Paths
//!
//! ```text
//!                     resolve session (handle, else fingerprint)
//!                                   |
//!              +--------- none -----+----- found ---------+
//!              |                                          |
//!             New                    select (affinity to owner)
//!      full prompt, fresh ids                 |
//!                              +-- owner -----+---- other credential ----+
//!                              |                                         |
//!                       SameCredential                     share link? --+-- no --> New
//!                 append newest user message                   |                (handle kept)
//!                                                             yes
//!                                                              |
//!                                                       CrossCredential
//!                                            clone, then append newest message
//! ```
//!
//! A clone that fails for a reason other than the credential itself falls
//! back to `New` under the same handle.
//!
//! # Retry
//!
//! A start that fails with a rate-limit or auth rejection is reported to the
//! pool and retried exactly once with another credential. Failures after the
//! stream has begun are never retried.
//!
//! # Single-flight
//!
//! The turn holds its handle's lock from resolution until the session is
//! finalized. A request that had to wait for the lock and is identical to the
//! turn that just finished is answered from that turn's stored transcript.
//!
//! The session is stored before the caller sees the terminal frame. The share
//! link is refreshed after `Done` is sent, still under the handle's lock, so
//! the next turn on the handle always sees it.
//!
//! # Quota
//!
//! After a successful turn the serving credential's remaining quota is
//! re-read in the background. At most one such check per credential is in
//! flight; failures are only logged.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashSet;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::context::{
    lookup_fingerprint, request_key, storage_fingerprint, ContextStore, ConversationSession,
    Fingerprint, HandleGuard, TurnReplay,
};
use crate::credentials::{CredentialLease, CredentialPool, CredentialState, NoAvailableCredential};
use crate::error::RelayError;
use crate::messages::{ChatMessage, ChatRequest, ConversationHandle, CredentialId, Role, TraceId};
use crate::models::{ModelRegistry, ResolvedModel};
use crate::persistence::StateSync;
use crate::stats::{StatsSink, TurnRecord, TurnStatus};
use crate::translator::{StreamFrame, StreamTranslator, TranslatorConfig};
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamEvent, UpstreamTurn};

// ============================================================================
// Configuration
// ============================================================================

/// Driver behavior
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Refresh the share link after every successful turn, not only after
    /// `New` and `CrossCredential`
    pub refresh_share_each_turn: bool,
    /// Re-read the credential's quota in the background after each success
    pub refresh_quota_after_turn: bool,
    /// Which fragment kinds reach the caller
    pub translator: TranslatorConfig,
    /// Frames buffered between the pump and the caller
    pub frame_buffer: usize,
    /// Longest silence tolerated between upstream events
    pub stream_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            refresh_share_each_turn: true,
            refresh_quota_after_turn: true,
            translator: TranslatorConfig::default(),
            frame_buffer: 32,
            stream_timeout: Duration::from_secs(600),
        }
    }
}

/// How a turn continued upstream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationPath {
    /// Fresh upstream conversation with the full message list
    New,
    /// Appended to the owner's conversation
    SameCredential,
    /// Cloned to another credential, then appended
    CrossCredential,
}

impl fmt::Display for ContinuationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::SameCredential => write!(f, "same_credential"),
            Self::CrossCredential => write!(f, "cross_credential"),
        }
    }
}

// ============================================================================
// Frame Stream
// ============================================================================

/// Frames of one turn, in order, ending with `Done` or `Error`
#[derive(Debug)]
pub struct FrameStream {
    handle: ConversationHandle,
    trace_id: TraceId,
    path: Option<ContinuationPath>,
    frames: mpsc::Receiver<StreamFrame>,
}

impl FrameStream {
    /// Conversation handle to continue with
    #[must_use]
    pub fn handle(&self) -> &ConversationHandle {
        &self.handle
    }

    /// Trace id of the request
    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Path the turn took; `None` for a replayed turn
    #[must_use]
    pub fn path(&self) -> Option<ContinuationPath> {
        self.path
    }

    /// Next frame; `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    /// Buffer the whole turn into one answer
    ///
    /// # Errors
    ///
    /// Returns the turn's error, or [`RelayError::StreamAborted`] if the
    /// stream closed without a terminal frame.
    pub async fn collect_text(&mut self) -> Result<String, RelayError> {
        let mut text = String::new();
        while let Some(frame) = self.frames.recv().await {
            match frame {
                StreamFrame::Done => return Ok(text),
                StreamFrame::Error(e) => return Err(e),
                other => text.push_str(other.text().unwrap_or_default()),
            }
        }
        Err(RelayError::StreamAborted)
    }
}

impl Stream for FrameStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_recv(cx)
    }
}

// ============================================================================
// Turn Bookkeeping
// ============================================================================

/// Everything known about a turn before upstream answers
#[derive(Debug)]
struct TurnContext {
    trace_id: TraceId,
    handle: ConversationHandle,
    request_model: String,
    model: ResolvedModel,
    previous: Option<ConversationSession>,
    storage_fingerprint: Option<Fingerprint>,
    request_key: String,
    started_ms: u64,
    stream: bool,
}

/// An upstream call that has been accepted
struct StartedTurn {
    lease: CredentialLease,
    path: ContinuationPath,
    events: mpsc::Receiver<UpstreamEvent>,
    base: Option<(String, String)>,
    fell_back: bool,
    retried: bool,
}

/// Why a turn could not start
enum StartError {
    Select(NoAvailableCredential),
    Upstream {
        credential: CredentialId,
        error: UpstreamError,
        clone_error: Option<UpstreamError>,
    },
}

/// Share link owed for a stored session once the caller has its answer
struct PendingShare {
    conversation_id: String,
    turn_id: String,
}

/// How the pump ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Aborted,
}

// ============================================================================
// Driver
// ============================================================================

/// Runs turns against the pool, the store and upstream
#[derive(Clone)]
pub struct ContinuationDriver {
    pool: Arc<CredentialPool>,
    store: Arc<ContextStore>,
    upstream: Arc<dyn UpstreamClient>,
    stats: Arc<dyn StatsSink>,
    sync: Arc<StateSync>,
    clock: Arc<dyn Clock>,
    registry: ModelRegistry,
    config: DriverConfig,
    quota_checks: Arc<DashSet<CredentialId>>,
}

impl ContinuationDriver {
    /// Create a driver over shared services
    #[must_use]
    pub fn new(
        pool: Arc<CredentialPool>,
        store: Arc<ContextStore>,
        upstream: Arc<dyn UpstreamClient>,
        stats: Arc<dyn StatsSink>,
        sync: Arc<StateSync>,
        clock: Arc<dyn Clock>,
        config: DriverConfig,
    ) -> Self {
        Self {
            pool,
            store,
            upstream,
            stats,
            sync,
            clock,
            registry: ModelRegistry,
            config,
            quota_checks: Arc::new(DashSet::new()),
        }
    }

    /// Driver settings
    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run one turn
    ///
    /// Returns once upstream has accepted the turn; frames then flow on the
    /// returned stream.
    ///
    /// # Errors
    ///
    /// Fails before any frame when the request is unusable, the handle is
    /// unknown, no credential is available, or upstream rejects the start
    /// (after the rotation retry).
    pub async fn run_turn(
        &self,
        request: &ChatRequest,
        trace_id: TraceId,
    ) -> Result<FrameStream, RelayError> {
        let latest = request
            .latest_user_message()
            .map(ChatMessage::text)
            .ok_or_else(|| RelayError::InvalidRequest("no user message".into()))?;

        // Resolve
        let resolved = match &request.conversation_id {
            Some(handle) => Some(
                self.store
                    .lookup_by_handle(handle)
                    .ok_or_else(|| RelayError::SessionNotFound(handle.clone()))?,
            ),
            None => lookup_fingerprint(&request.messages)
                .and_then(|fp| self.store.lookup_by_fingerprint(&fp)),
        };
        let handle = resolved
            .as_ref()
            .map_or_else(ConversationHandle::new, |s| s.handle.clone());

        let guard = self.store.acquire(&handle).await;
        // Another turn may have run while we waited
        let session = match resolved {
            Some(_) => match self.store.lookup_by_handle(&handle) {
                Some(s) => Some(s),
                None if request.conversation_id.is_some() => {
                    return Err(RelayError::SessionNotFound(handle));
                }
                None => None,
            },
            None => None,
        };

        let ctx = TurnContext {
            trace_id,
            handle,
            request_model: request.model.clone(),
            model: self.registry.resolve(&request.model),
            previous: session,
            storage_fingerprint: storage_fingerprint(&request.messages),
            request_key: request_key(&request.model, &request.messages),
            started_ms: self.clock.now_ms(),
            stream: request.stream,
        };

        if guard.was_contended() {
            let replay = ctx
                .previous
                .as_ref()
                .and_then(|s| s.last_turn.as_ref())
                .filter(|r| r.request_key == ctx.request_key)
                .map(|r| r.content.clone());
            if let Some(content) = replay {
                return Ok(self.replay(&ctx, content));
            }
        }

        let started = match self.start_with_retry(&ctx, &request.messages, &latest).await {
            Ok(started) => started,
            Err(error) => {
                self.record(&ctx, None, None, TurnStatus::Failed, Some(&error), false, false);
                return Err(error);
            }
        };

        tracing::info!(
            trace_id = %ctx.trace_id,
            handle = %ctx.handle,
            path = %started.path,
            credential = %started.lease.id,
            model = %ctx.model.id,
            "Turn started"
        );

        let (tx, rx) = mpsc::channel(self.config.frame_buffer.max(1));
        let stream = FrameStream {
            handle: ctx.handle.clone(),
            trace_id: ctx.trace_id.clone(),
            path: Some(started.path),
            frames: rx,
        };
        let driver = self.clone();
        tokio::spawn(async move {
            driver.pump(ctx, started, guard, tx).await;
        });
        Ok(stream)
    }

    // ------------------------------------------------------------------------
    // Starting
    // ------------------------------------------------------------------------

    async fn start_with_retry(
        &self,
        ctx: &TurnContext,
        messages: &[ChatMessage],
        latest: &str,
    ) -> Result<StartedTurn, RelayError> {
        let mut excluded: Vec<CredentialId> = Vec::new();
        let mut first_error: Option<RelayError> = None;

        loop {
            let retried = first_error.is_some();
            match self.start(ctx, messages, latest, &excluded).await {
                Ok(mut started) => {
                    started.retried = retried;
                    return Ok(started);
                }
                Err(StartError::Select(e)) => {
                    // After a rotation the upstream rejection says more than
                    // an empty pool does
                    return Err(first_error.unwrap_or(RelayError::CredentialExhausted(e)));
                }
                Err(StartError::Upstream {
                    credential,
                    error,
                    clone_error,
                }) => {
                    self.report_upstream_failure(&credential, &error);
                    let rotatable = error.is_rotatable();
                    let relay_error = match clone_error {
                        Some(clone_error) if !rotatable => RelayError::CloneFailed(format!(
                            "{clone_error}; full resend also failed: {error}"
                        )),
                        _ => RelayError::from_upstream(&credential, error),
                    };
                    if !rotatable || retried {
                        return Err(relay_error);
                    }
                    tracing::warn!(
                        trace_id = %ctx.trace_id,
                        credential = %credential,
                        error = %relay_error,
                        "Upstream rejected credential, rotating"
                    );
                    excluded.push(credential);
                    first_error = Some(relay_error);
                }
            }
        }
    }

    async fn start(
        &self,
        ctx: &TurnContext,
        messages: &[ChatMessage],
        latest: &str,
        excluded: &[CredentialId],
    ) -> Result<StartedTurn, StartError> {
        let owner = ctx.previous.as_ref().map(|s| &s.credential);
        let lease = self
            .pool
            .select_with(owner, excluded)
            .map_err(StartError::Select)?;
        let upstream_error = |lease: &CredentialLease, error| StartError::Upstream {
            credential: lease.id.clone(),
            error,
            clone_error: None,
        };

        let Some(session) = &ctx.previous else {
            return self.start_new(ctx, messages, lease, false, None).await;
        };

        let turn = UpstreamTurn::new(latest, &ctx.model.upstream_model, &ctx.model.mode);

        if session.credential == lease.id {
            let events = self
                .upstream
                .append_response(&lease, &session.conversation_id, &session.last_turn_id, &turn)
                .await
                .map_err(|e| upstream_error(&lease, e))?;
            return Ok(StartedTurn {
                base: Some((session.conversation_id.clone(), session.last_turn_id.clone())),
                lease,
                path: ContinuationPath::SameCredential,
                events,
                fell_back: false,
                retried: false,
            });
        }

        let Some(link) = &session.share_link else {
            tracing::info!(
                handle = %ctx.handle,
                from = %session.credential,
                to = %lease.id,
                "No share link, resending full history"
            );
            return self.start_new(ctx, messages, lease, true, None).await;
        };

        match self.upstream.clone_share_link(&lease, link).await {
            Ok(cloned) => {
                tracing::debug!(
                    handle = %ctx.handle,
                    from = %session.credential,
                    to = %lease.id,
                    "Conversation cloned"
                );
                let events = self
                    .upstream
                    .append_response(&lease, &cloned.conversation_id, &cloned.turn_id, &turn)
                    .await
                    .map_err(|e| upstream_error(&lease, e))?;
                Ok(StartedTurn {
                    base: Some((cloned.conversation_id, cloned.turn_id)),
                    lease,
                    path: ContinuationPath::CrossCredential,
                    events,
                    fell_back: false,
                    retried: false,
                })
            }
            Err(e) if e.is_rotatable() => Err(upstream_error(&lease, e)),
            Err(e) => {
                tracing::warn!(
                    handle = %ctx.handle,
                    credential = %lease.id,
                    error = %e,
                    "Clone failed, resending full history"
                );
                self.start_new(ctx, messages, lease, true, Some(e)).await
            }
        }
    }

    async fn start_new(
        &self,
        ctx: &TurnContext,
        messages: &[ChatMessage],
        lease: CredentialLease,
        fell_back: bool,
        clone_error: Option<UpstreamError>,
    ) -> Result<StartedTurn, StartError> {
        let turn = UpstreamTurn::new(
            compose_prompt(messages),
            &ctx.model.upstream_model,
            &ctx.model.mode,
        );
        match self.upstream.create_conversation(&lease, &turn).await {
            Ok(events) => Ok(StartedTurn {
                lease,
                path: ContinuationPath::New,
                events,
                base: None,
                fell_back,
                retried: false,
            }),
            Err(error) => Err(StartError::Upstream {
                credential: lease.id,
                error,
                clone_error,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    async fn pump(
        &self,
        ctx: TurnContext,
        started: StartedTurn,
        guard: HandleGuard,
        tx: mpsc::Sender<StreamFrame>,
    ) {
        let StartedTurn {
            lease,
            path,
            mut events,
            base,
            fell_back,
            retried,
        } = started;
        let mut translator = StreamTranslator::new(self.config.translator, lease.id.clone());
        if let Some((conversation_id, turn_id)) = &base {
            translator = translator.with_progress(conversation_id, turn_id);
        }
        let idle = self.config.stream_timeout;

        let outcome = 'pump: loop {
            let next = tokio::select! {
                biased;
                () = tx.closed() => None,
                next = tokio::time::timeout(idle, events.recv()) => Some(next),
            };
            let frames = match next {
                None => break Outcome::Aborted,
                Some(Ok(Some(event))) => translator.translate(event),
                Some(Ok(None)) => translator.finish(),
                Some(Err(_)) => translator.translate(UpstreamEvent::Failed(
                    UpstreamError::Unavailable(format!(
                        "no upstream event within {}s",
                        idle.as_secs()
                    )),
                )),
            };

            for frame in frames {
                if frame.is_terminal() {
                    let outcome = if matches!(frame, StreamFrame::Done) {
                        Outcome::Completed
                    } else {
                        Outcome::Failed
                    };
                    // Persist before the caller can observe the end of the turn
                    let share = self
                        .finalize(&ctx, &lease, path, &translator, outcome, retried, fell_back);
                    let _ = tx.send(frame).await;
                    if let Some(share) = share {
                        self.refresh_share(&ctx, &lease, share).await;
                    }
                    drop(guard);
                    return;
                }
                if tx.send(frame).await.is_err() {
                    break 'pump Outcome::Aborted;
                }
            }
        };

        // Dropping the receiver aborts the upstream call
        drop(events);
        tracing::info!(trace_id = %ctx.trace_id, handle = %ctx.handle, "Caller went away mid-stream");
        // Nothing is owed for an aborted turn
        let _ = self.finalize(&ctx, &lease, path, &translator, outcome, retried, fell_back);
        drop(guard);
    }

    /// Record the turn: session, pool health, statistics
    ///
    /// Returns the share link still owed for the stored session, if any.
    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        ctx: &TurnContext,
        lease: &CredentialLease,
        path: ContinuationPath,
        translator: &StreamTranslator,
        outcome: Outcome,
        retried: bool,
        fell_back: bool,
    ) -> Option<PendingShare> {
        let now = self.clock.now_ms();
        let mut pending = None;

        if let (Some(conversation_id), Some(turn_id)) =
            (translator.conversation_id(), translator.last_turn_id())
        {
            let completed = outcome == Outcome::Completed;
            let migrated = ctx
                .previous
                .as_ref()
                .map_or(true, |p| p.conversation_id != conversation_id);
            let advanced = ctx
                .previous
                .as_ref()
                .map_or(true, |p| p.last_turn_id != turn_id);

            if completed || migrated || advanced {
                let mut session = ctx.previous.clone().unwrap_or_else(|| {
                    ConversationSession::new(
                        ctx.handle.clone(),
                        conversation_id,
                        turn_id,
                        lease.id.clone(),
                        now,
                    )
                });
                if migrated {
                    // A link into the old conversation says nothing about this one
                    session.share_link = None;
                }
                session.conversation_id = conversation_id.to_string();
                session.last_turn_id = turn_id.to_string();
                session.credential = lease.id.clone();
                session.model.clone_from(&ctx.model.id);
                session.last_used_ms = now;
                session.last_turn = None;

                if completed {
                    session.fingerprint.clone_from(&ctx.storage_fingerprint);
                    session.turns += 1;
                    session.last_turn = Some(TurnReplay {
                        request_key: ctx.request_key.clone(),
                        content: translator.transcript().to_string(),
                    });
                    if path != ContinuationPath::SameCredential
                        || self.config.refresh_share_each_turn
                        || session.share_link.is_none()
                    {
                        pending = Some(PendingShare {
                            conversation_id: conversation_id.to_string(),
                            turn_id: turn_id.to_string(),
                        });
                    }
                }

                let evicted = self.store.upsert(session);
                if !evicted.is_empty() {
                    tracing::debug!(credential = %lease.id, count = evicted.len(), "Capacity eviction after turn");
                }
                self.sync.mark_sessions();
            }
        } else if outcome == Outcome::Completed {
            tracing::warn!(
                trace_id = %ctx.trace_id,
                handle = %ctx.handle,
                "Upstream finished without conversation ids; session not recorded"
            );
        }

        let error = match outcome {
            Outcome::Completed => {
                match self.pool.report_success(&lease.id) {
                    Ok(()) => self.refresh_quota(lease),
                    Err(e) => {
                        tracing::debug!(credential = %lease.id, error = %e, "Success for removed credential");
                    }
                }
                None
            }
            Outcome::Failed => {
                let failure = translator
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| UpstreamError::Protocol("turn failed".into()));
                self.report_upstream_failure(&lease.id, &failure);
                Some(RelayError::from_upstream(&lease.id, failure))
            }
            Outcome::Aborted => Some(RelayError::StreamAborted),
        };
        self.sync.mark_credentials();

        let status = match outcome {
            Outcome::Completed => TurnStatus::Success,
            Outcome::Failed => TurnStatus::Failed,
            Outcome::Aborted => TurnStatus::Aborted,
        };
        self.record(
            ctx,
            Some(lease),
            Some(path),
            status,
            error.as_ref(),
            retried,
            fell_back,
        );
        pending
    }

    /// Attach a fresh share link to the stored session
    ///
    /// A failed request clears the link, so the next migration resends the
    /// full history instead of cloning a stale point.
    async fn refresh_share(&self, ctx: &TurnContext, lease: &CredentialLease, share: PendingShare) {
        let link = self
            .share(lease, &share.conversation_id, &share.turn_id, &ctx.handle)
            .await;
        let Some(mut session) = self.store.lookup_by_handle(&ctx.handle) else {
            tracing::debug!(handle = %ctx.handle, "Session gone before share link arrived");
            return;
        };
        session.share_link = link;
        let _ = self.store.upsert(session);
        self.sync.mark_sessions();
    }

    /// Re-read `lease`'s remaining quota on a background task
    fn refresh_quota(&self, lease: &CredentialLease) {
        if !self.config.refresh_quota_after_turn {
            return;
        }
        let disabled = self
            .pool
            .get(&lease.id)
            .map_or(true, |c| c.state == CredentialState::Disabled);
        if disabled || !self.quota_checks.insert(lease.id.clone()) {
            return;
        }

        let driver = self.clone();
        let lease = lease.clone();
        tokio::spawn(async move {
            let result = driver.upstream.check_quota(&lease).await;
            driver.quota_checks.remove(&lease.id);
            match result {
                Ok(status) => {
                    if driver.pool.update_quota(&lease.id, status.remaining_quota).is_ok() {
                        driver.sync.mark_credentials();
                    }
                    tracing::debug!(
                        credential = %lease.id,
                        remaining = status.remaining_quota,
                        "Quota refreshed after turn"
                    );
                }
                Err(e) => {
                    tracing::debug!(credential = %lease.id, error = %e, "Background quota check failed");
                }
            }
        });
    }

    /// Best-effort share link for the conversation at `turn_id`
    async fn share(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        turn_id: &str,
        handle: &ConversationHandle,
    ) -> Option<String> {
        match self
            .upstream
            .create_share_link(lease, conversation_id, turn_id)
            .await
        {
            Ok(link) => Some(link),
            Err(e) => {
                tracing::warn!(
                    handle = %handle,
                    credential = %lease.id,
                    error = %e,
                    "Share link unavailable; next migration resends full history"
                );
                None
            }
        }
    }

    fn report_upstream_failure(&self, credential: &CredentialId, error: &UpstreamError) {
        if let Err(e) = self.pool.report_failure(credential, error.failure_class()) {
            tracing::debug!(credential = %credential, error = %e, "Failure for removed credential");
        }
        self.sync.mark_credentials();
    }

    // ------------------------------------------------------------------------
    // Replay and Records
    // ------------------------------------------------------------------------

    fn replay(&self, ctx: &TurnContext, content: String) -> FrameStream {
        tracing::info!(
            trace_id = %ctx.trace_id,
            handle = %ctx.handle,
            "Duplicate of the turn just finished, replaying"
        );
        let (tx, rx) = mpsc::channel(2);
        // Capacity 2 fits both frames
        let _ = tx.try_send(StreamFrame::TextDelta(content));
        let _ = tx.try_send(StreamFrame::Done);
        let owner = ctx.previous.as_ref().map(|s| s.credential.clone());
        self.record_with(ctx, owner, None, None, TurnStatus::Replayed, None, false, false);
        FrameStream {
            handle: ctx.handle.clone(),
            trace_id: ctx.trace_id.clone(),
            path: None,
            frames: rx,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        ctx: &TurnContext,
        lease: Option<&CredentialLease>,
        path: Option<ContinuationPath>,
        status: TurnStatus,
        error: Option<&RelayError>,
        retried: bool,
        fell_back: bool,
    ) {
        self.record_with(
            ctx,
            lease.map(|l| l.id.clone()),
            lease.map(CredentialLease::preview),
            path,
            status,
            error,
            retried,
            fell_back,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn record_with(
        &self,
        ctx: &TurnContext,
        credential: Option<CredentialId>,
        credential_preview: Option<String>,
        path: Option<ContinuationPath>,
        status: TurnStatus,
        error: Option<&RelayError>,
        retried: bool,
        fell_back: bool,
    ) {
        let record = TurnRecord {
            trace_id: ctx.trace_id.clone(),
            handle: Some(ctx.handle.clone()),
            model: ctx.request_model.clone(),
            credential,
            credential_preview,
            path,
            status,
            error: error.map(|e| e.code().to_string()),
            duration_ms: self.clock.now_ms().saturating_sub(ctx.started_ms),
            stream: ctx.stream,
            retried,
            fell_back,
        };
        self.stats.turn_completed(&record);
        self.sync.mark_requests();
    }
}

impl fmt::Debug for ContinuationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationDriver")
            .field("upstream", &self.upstream.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Flatten a message list into one upstream prompt
///
/// A lone user message is sent verbatim; anything else becomes
/// `role: content` blocks separated by blank lines.
#[must_use]
pub fn compose_prompt(messages: &[ChatMessage]) -> String {
    if let [only] = messages {
        if only.role == Role::User {
            return only.text();
        }
    }
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
