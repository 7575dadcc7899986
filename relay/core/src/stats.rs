//! Operational Statistics
//!
//! Observability for the relay:
//! - Credential pool transitions (cooling, disabled, reactivated)
//! - Per-turn outcomes and latency
//! - A bounded log of recent requests for operators
//!
//! Nothing recorded here feeds back into control flow. The pool and the
//! continuation driver report into a [`StatsSink`]; [`RelayStats`] is the
//! default sink, which logs through `tracing` and keeps in-memory counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::credentials::CredentialState;
use crate::driver::ContinuationPath;
use crate::messages::{ConversationHandle, CredentialId, TraceId};

// ============================================================================
// Sink
// ============================================================================

/// Receiver of pool transitions and turn outcomes
pub trait StatsSink: Send + Sync {
    /// A credential changed state
    fn credential_transition(
        &self,
        credential: &CredentialId,
        from: CredentialState,
        to: CredentialState,
        reason: &str,
    );

    /// A turn finished (successfully or not)
    fn turn_completed(&self, record: &TurnRecord);
}

/// How a turn ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Upstream finished the turn
    Success,
    /// Upstream or the relay failed the turn
    Failed,
    /// The caller went away mid-stream
    Aborted,
    /// Served from a concurrent identical turn
    Replayed,
}

/// Outcome of one turn, as reported by the continuation driver
#[derive(Clone, Debug)]
pub struct TurnRecord {
    /// Request trace id
    pub trace_id: TraceId,
    /// Conversation handle, when one was resolved or created
    pub handle: Option<ConversationHandle>,
    /// Model requested by the caller
    pub model: String,
    /// Credential that served the turn
    pub credential: Option<CredentialId>,
    /// Loggable preview of that credential's secret
    pub credential_preview: Option<String>,
    /// Path the driver took
    pub path: Option<ContinuationPath>,
    /// Outcome
    pub status: TurnStatus,
    /// Error code for failed turns
    pub error: Option<String>,
    /// Wall time from request to completion
    pub duration_ms: u64,
    /// Whether the caller streamed
    pub stream: bool,
    /// Whether the turn needed the rotation retry
    pub retried: bool,
    /// Whether a share-link clone failed and the turn fell back to a resend
    pub fell_back: bool,
}

// ============================================================================
// Counters and Histogram
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram with fixed millisecond buckets
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given upper bounds (ascending)
    #[must_use]
    pub fn new(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to chat turns, 100 ms to 10 min
    #[must_use]
    pub fn turn_latency() -> Self {
        Self::new(vec![
            100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000, 300_000, 600_000,
        ])
    }

    /// Record one observation
    pub fn record(&self, value_ms: u64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));
        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.max.fetch_max(value_ms, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum / total } else { 0 },
        }
    }
}

/// Snapshot of a [`Histogram`]
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds
    pub buckets: Vec<u64>,
    /// Observations per bucket
    pub counts: Vec<u64>,
    /// Total observations
    pub total: u64,
    /// Largest observation
    pub max: u64,
    /// Integer mean
    pub mean: u64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let target = ((self.total as f64) * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        self.buckets.last().copied().unwrap_or(0)
    }

    /// Median bucket
    #[must_use]
    pub fn p50(&self) -> u64 {
        self.percentile(0.5)
    }

    /// 99th percentile bucket
    #[must_use]
    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }
}

/// Relay-wide counters
#[derive(Debug)]
pub struct RelayMetrics {
    /// Turns attempted
    pub requests: Counter,
    /// Turns completed by upstream
    pub successes: Counter,
    /// Turns that failed
    pub failures: Counter,
    /// Turns the caller abandoned
    pub cancellations: Counter,
    /// Turns that used the rotation retry
    pub retries: Counter,
    /// Turns answered from a concurrent identical turn
    pub replays: Counter,
    /// New conversations
    pub new_conversations: Counter,
    /// Same-credential continuations
    pub same_credential: Counter,
    /// Cross-credential continuations via clone
    pub cross_credential: Counter,
    /// Clone failures that fell back to full resend
    pub fallbacks: Counter,
    /// Pool transitions into Cooling
    pub cooldowns: Counter,
    /// Pool transitions into Disabled
    pub disables: Counter,
    /// Turn latency
    pub latency: Histogram,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            requests: Counter::default(),
            successes: Counter::default(),
            failures: Counter::default(),
            cancellations: Counter::default(),
            retries: Counter::default(),
            replays: Counter::default(),
            new_conversations: Counter::default(),
            same_credential: Counter::default(),
            cross_credential: Counter::default(),
            fallbacks: Counter::default(),
            cooldowns: Counter::default(),
            disables: Counter::default(),
            latency: Histogram::turn_latency(),
        }
    }
}

impl RelayMetrics {
    /// Point-in-time copy
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency.snapshot();
        MetricsSnapshot {
            requests: self.requests.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            cancellations: self.cancellations.get(),
            retries: self.retries.get(),
            replays: self.replays.get(),
            new_conversations: self.new_conversations.get(),
            same_credential: self.same_credential.get(),
            cross_credential: self.cross_credential.get(),
            fallbacks: self.fallbacks.get(),
            cooldowns: self.cooldowns.get(),
            disables: self.disables.get(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            latency_max_ms: latency.max,
        }
    }
}

/// Serializable copy of [`RelayMetrics`]
#[derive(Clone, Debug, Default, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub retries: u64,
    pub replays: u64,
    pub new_conversations: u64,
    pub same_credential: u64,
    pub cross_credential: u64,
    pub fallbacks: u64,
    pub cooldowns: u64,
    pub disables: u64,
    pub latency_p50_ms: u64,
    pub latency_p99_ms: u64,
    pub latency_max_ms: u64,
}

// ============================================================================
// Request Log
// ============================================================================

/// One entry in the request log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
    /// `<epoch ms>-<counter>`
    pub id: String,
    /// Completion time
    pub timestamp: DateTime<Utc>,
    /// Requested model
    pub model: String,
    /// Secret preview of the serving credential
    pub credential_preview: Option<String>,
    /// Outcome
    pub status: TurnStatus,
    /// Error code for failed turns
    pub error: Option<String>,
    /// Wall time
    pub duration_ms: u64,
    /// Whether the caller streamed
    pub stream: bool,
    /// Request trace id
    pub trace_id: TraceId,
}

/// Bounded ring of recent requests, newest last
#[derive(Debug)]
pub struct RequestLog {
    entries: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
    counter: AtomicU64,
}

impl RequestLog {
    /// Create a log holding at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            counter: AtomicU64::new(0),
        }
    }

    /// Append a record built from a turn outcome
    pub fn push(&self, record: &TurnRecord, now_ms: u64) {
        if self.capacity == 0 {
            return;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let timestamp = i64::try_from(now_ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let entry = RequestRecord {
            id: format!("{now_ms}-{n}"),
            timestamp,
            model: record.model.clone(),
            credential_preview: record.credential_preview.clone(),
            status: record.status,
            error: record.error.clone(),
            duration_ms: record.duration_ms,
            stream: record.stream,
            trace_id: record.trace_id.clone(),
        };

        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Every retained entry, oldest first
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Replace the log with persisted entries, keeping the newest that fit
    pub fn restore(&self, records: Vec<RequestRecord>) {
        let skip = records.len().saturating_sub(self.capacity);
        let mut entries = self.entries.lock();
        entries.clear();
        entries.extend(records.into_iter().skip(skip));
    }

    /// Most recent `limit` entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

// ============================================================================
// Default Sink
// ============================================================================

/// Default [`StatsSink`]: tracing plus in-memory counters and request log
#[derive(Debug)]
pub struct RelayStats {
    metrics: RelayMetrics,
    log: RequestLog,
    clock: Arc<dyn Clock>,
}

impl RelayStats {
    /// Create a sink whose request log keeps `max_log_entries` entries
    #[must_use]
    pub fn new(max_log_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            metrics: RelayMetrics::default(),
            log: RequestLog::new(max_log_entries),
            clock,
        }
    }

    /// Counters
    #[must_use]
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Request log
    #[must_use]
    pub fn log(&self) -> &RequestLog {
        &self.log
    }
}

impl StatsSink for RelayStats {
    fn credential_transition(
        &self,
        credential: &CredentialId,
        from: CredentialState,
        to: CredentialState,
        reason: &str,
    ) {
        match to {
            CredentialState::Cooling => {
                self.metrics.cooldowns.inc();
                tracing::warn!(credential = %credential, %from, %to, reason, "Credential cooling down");
            }
            CredentialState::Disabled => {
                self.metrics.disables.inc();
                tracing::warn!(credential = %credential, %from, %to, reason, "Credential disabled");
            }
            CredentialState::Active => {
                tracing::info!(credential = %credential, %from, %to, reason, "Credential active again");
            }
        }
    }

    fn turn_completed(&self, record: &TurnRecord) {
        let m = &self.metrics;
        m.requests.inc();
        match record.status {
            TurnStatus::Success => m.successes.inc(),
            TurnStatus::Failed => m.failures.inc(),
            TurnStatus::Aborted => m.cancellations.inc(),
            TurnStatus::Replayed => m.replays.inc(),
        }
        if record.retried {
            m.retries.inc();
        }
        if record.fell_back {
            m.fallbacks.inc();
        }
        match record.path {
            Some(ContinuationPath::New) => m.new_conversations.inc(),
            Some(ContinuationPath::SameCredential) => m.same_credential.inc(),
            Some(ContinuationPath::CrossCredential) => m.cross_credential.inc(),
            None => {}
        }
        m.latency.record(record.duration_ms);
        self.log.push(record, self.clock.now_ms());

        tracing::info!(
            trace_id = %record.trace_id,
            handle = ?record.handle.as_ref().map(ConversationHandle::as_str),
            credential = ?record.credential.as_ref().map(CredentialId::as_str),
            path = ?record.path,
            status = ?record.status,
            error = ?record.error,
            duration_ms = record.duration_ms,
            stream = record.stream,
            "Turn completed"
        );
    }
}
