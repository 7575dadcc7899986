//! Durable State
//!
//! Credentials (with their health), conversation sessions and the request
//! log survive restarts through a [`StateStore`]. The relay never blocks a
//! turn on persistence: mutations only mark state dirty and wake the
//! orchestrator's maintenance loop, which flushes through [`StateSync`].
//! Marks that land while a flush is running coalesce into one more flush.
//!
//! # Files
//!
//! [`JsonFileStore`] keeps three documents under its data directory:
//!
//! - `credentials.json` - every credential, secret included
//! - `sessions.json` - every live conversation session
//! - `request_logs.json` - the most recent request log entries
//!
//! Each write goes to a temporary file that is then renamed over the
//! target, so a crash never leaves a half-written document.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{ContextStore, ConversationSession};
use crate::credentials::{Credential, CredentialPool};
use crate::stats::{RequestLog, RequestRecord};

/// Document format version
const FORMAT_VERSION: u32 = 1;

/// Credentials document name
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Sessions document name
pub const SESSIONS_FILE: &str = "sessions.json";

/// Request log document name
pub const REQUEST_LOG_FILE: &str = "request_logs.json";

// ============================================================================
// Errors
// ============================================================================

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Document could not be encoded or decoded
    #[error("malformed state document {path}: {source}")]
    Format {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// Unsupported document version
    #[error("unsupported state version {found} in {path}")]
    Version {
        /// File involved
        path: PathBuf,
        /// Version found
        found: u32,
    },
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable key-value persistence for relay state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every persisted credential
    async fn load_credentials(&self) -> Result<Vec<Credential>, StoreError>;

    /// Replace the persisted credentials
    async fn save_credentials(&self, credentials: &[Credential]) -> Result<(), StoreError>;

    /// Load every persisted session
    async fn load_sessions(&self) -> Result<Vec<ConversationSession>, StoreError>;

    /// Replace the persisted sessions
    async fn save_sessions(&self, sessions: &[ConversationSession]) -> Result<(), StoreError>;

    /// Load the persisted request log, oldest first
    async fn load_request_log(&self) -> Result<Vec<RequestRecord>, StoreError>;

    /// Replace the persisted request log
    async fn save_request_log(&self, records: &[RequestRecord]) -> Result<(), StoreError>;
}

// ============================================================================
// JSON Files
// ============================================================================

#[derive(Deserialize)]
struct Document<T> {
    version: u32,
    items: Vec<T>,
}

#[derive(Serialize)]
struct DocumentRef<'a, T> {
    version: u32,
    updated_at: DateTime<Utc>,
    items: &'a [T],
}

/// [`StateStore`] writing JSON documents under a directory
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Data directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No state document yet");
                return Ok(Vec::new());
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let doc: Document<T> = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Format {
                path: path.clone(),
                source,
            })?;
        if doc.version != FORMAT_VERSION {
            return Err(StoreError::Version {
                path,
                found: doc.version,
            });
        }
        Ok(doc.items)
    }

    async fn write<T: Serialize + Sync>(&self, name: &str, items: &[T]) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let doc = DocumentRef {
            version: FORMAT_VERSION,
            updated_at: Utc::now(),
            items,
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Format {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::trace!(path = %path.display(), items = items.len(), "State document written");
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        self.read(CREDENTIALS_FILE).await
    }

    async fn save_credentials(&self, credentials: &[Credential]) -> Result<(), StoreError> {
        self.write(CREDENTIALS_FILE, credentials).await
    }

    async fn load_sessions(&self) -> Result<Vec<ConversationSession>, StoreError> {
        self.read(SESSIONS_FILE).await
    }

    async fn save_sessions(&self, sessions: &[ConversationSession]) -> Result<(), StoreError> {
        self.write(SESSIONS_FILE, sessions).await
    }

    async fn load_request_log(&self) -> Result<Vec<RequestRecord>, StoreError> {
        self.read(REQUEST_LOG_FILE).await
    }

    async fn save_request_log(&self, records: &[RequestRecord]) -> Result<(), StoreError> {
        self.write(REQUEST_LOG_FILE, records).await
    }
}

// ============================================================================
// In Memory
// ============================================================================

/// [`StateStore`] kept in memory, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: Mutex<Vec<Credential>>,
    sessions: Mutex<Vec<ConversationSession>>,
    requests: Mutex<Vec<RequestRecord>>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.credentials.lock().clone())
    }

    async fn save_credentials(&self, credentials: &[Credential]) -> Result<(), StoreError> {
        *self.credentials.lock() = credentials.to_vec();
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<ConversationSession>, StoreError> {
        Ok(self.sessions.lock().clone())
    }

    async fn save_sessions(&self, sessions: &[ConversationSession]) -> Result<(), StoreError> {
        *self.sessions.lock() = sessions.to_vec();
        Ok(())
    }

    async fn load_request_log(&self) -> Result<Vec<RequestRecord>, StoreError> {
        Ok(self.requests.lock().clone())
    }

    async fn save_request_log(&self, records: &[RequestRecord]) -> Result<(), StoreError> {
        *self.requests.lock() = records.to_vec();
        Ok(())
    }
}

// ============================================================================
// Dirty Tracking
// ============================================================================

/// Tracks which state changed since the last flush
#[derive(Debug, Default)]
pub struct StateSync {
    credentials_dirty: AtomicBool,
    sessions_dirty: AtomicBool,
    requests_dirty: AtomicBool,
    wake: Notify,
}

impl StateSync {
    /// Nothing dirty
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials changed
    pub fn mark_credentials(&self) {
        self.credentials_dirty.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Sessions changed
    pub fn mark_sessions(&self) {
        self.sessions_dirty.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Request log grew
    pub fn mark_requests(&self) {
        self.requests_dirty.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Whether anything awaits a flush
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.credentials_dirty.load(Ordering::Acquire)
            || self.sessions_dirty.load(Ordering::Acquire)
            || self.requests_dirty.load(Ordering::Acquire)
    }

    /// Resolves once something has been marked since the last wait
    ///
    /// Any number of marks between two waits yield a single wakeup.
    pub async fn changed(&self) {
        self.wake.notified().await;
    }

    /// Write whatever changed; failures are logged and the state stays dirty
    ///
    /// Returns `true` when everything dirty was written.
    pub async fn flush(
        &self,
        pool: &CredentialPool,
        sessions: &ContextStore,
        requests: &RequestLog,
        store: &dyn StateStore,
    ) -> bool {
        let mut ok = true;
        if self.credentials_dirty.swap(false, Ordering::AcqRel) {
            let snapshot = pool.snapshot();
            if let Err(e) = store.save_credentials(&snapshot).await {
                tracing::warn!(error = %e, "Failed to persist credentials");
                // Retried on the next sweep
                self.credentials_dirty.store(true, Ordering::Release);
                ok = false;
            }
        }
        if self.sessions_dirty.swap(false, Ordering::AcqRel) {
            let snapshot = sessions.snapshot();
            if let Err(e) = store.save_sessions(&snapshot).await {
                tracing::warn!(error = %e, "Failed to persist sessions");
                self.sessions_dirty.store(true, Ordering::Release);
                ok = false;
            }
        }
        if self.requests_dirty.swap(false, Ordering::AcqRel) {
            let snapshot = requests.snapshot();
            if let Err(e) = store.save_request_log(&snapshot).await {
                tracing::warn!(error = %e, "Failed to persist request log");
                self.requests_dirty.store(true, Ordering::Release);
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ConversationHandle, CredentialId};
    use tempfile::TempDir;

    fn session(handle: &str) -> ConversationSession {
        ConversationSession::new(
            ConversationHandle::from(handle),
            "conv",
            "turn",
            CredentialId::from("cred"),
            1_000,
        )
    }

    #[tokio::test]
    async fn test_missing_documents_load_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));
        assert!(store.load_credentials().await.unwrap().is_empty());
        assert!(store.load_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_survive_reload() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        store
            .save_sessions(&[session("conv-a"), session("conv-b")])
            .await
            .unwrap();

        let reopened = JsonFileStore::new(dir.path());
        let loaded = reopened.load_sessions().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].handle.as_str(), "conv-a");
        assert!(!dir.path().join("sessions.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_credentials_keep_secret_and_state() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let cred = Credential::new("secret-value-123456", "main", 5);
        store.save_credentials(&[cred.clone()]).await.unwrap();
        let loaded = store.load_credentials().await.unwrap();
        assert_eq!(loaded[0].secret, cred.secret);
        assert_eq!(loaded[0].id, cred.id);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SESSIONS_FILE), b"{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.load_sessions().await.unwrap_err();
        assert!(matches!(err, StoreError::Format { .. }));
    }

    #[tokio::test]
    async fn test_request_log_document() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_request_log().await.unwrap().is_empty());

        let log = RequestLog::new(4);
        let sync = StateSync::new();
        let clock = std::sync::Arc::new(crate::clock::ManualClock::default());
        let stats = std::sync::Arc::new(crate::stats::RelayStats::new(4, clock.clone()));
        let pool = CredentialPool::new(Default::default(), clock.clone(), stats);
        let sessions = ContextStore::new(Default::default(), clock);
        log.restore(vec![RequestRecord {
            id: "1-0".into(),
            timestamp: Utc::now(),
            model: "grok-3".into(),
            credential_preview: None,
            status: crate::stats::TurnStatus::Success,
            error: None,
            duration_ms: 12,
            stream: false,
            trace_id: crate::messages::TraceId::new(),
        }]);

        sync.mark_requests();
        assert!(sync.flush(&pool, &sessions, &log, &store).await);
        assert!(!sync.is_dirty());
        let loaded = store.load_request_log().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "1-0");
    }

    #[tokio::test]
    async fn test_marks_coalesce_into_one_wakeup() {
        let sync = StateSync::new();
        sync.mark_sessions();
        sync.mark_credentials();
        sync.mark_requests();

        tokio::time::timeout(std::time::Duration::from_secs(1), sync.changed())
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), sync.changed())
                .await
                .is_err()
        );
        assert!(sync.is_dirty());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save_sessions(&[session("conv-x")]).await.unwrap();
        assert_eq!(store.load_sessions().await.unwrap().len(), 1);
    }
}
