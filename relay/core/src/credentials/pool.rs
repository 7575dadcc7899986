//! Credential Pool
//!
//! Owns every credential and decides which one serves the next upstream call.
//!
//! # Selection
//!
//! Among Active credentials (after lazily reactivating any whose cooldown has
//! elapsed), the least-recently-selected one wins. Credentials never selected
//! share the same key, so ties fall to rotation order: insertion order,
//! starting after a cursor that advances on every selection. In steady state
//! this is plain round-robin.
//!
//! # Concurrency
//!
//! Each credential sits behind its own `parking_lot::Mutex` inside a
//! `DashMap`. Selection, success and failure reports lock only the credential
//! they touch, so unrelated credentials never contend.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use super::credential::{
    normalize_secret, preview_secret, Credential, CredentialState, FailureClass, Tier,
};
use crate::clock::{duration_ms, Clock};
use crate::messages::CredentialId;
use crate::stats::StatsSink;

// ============================================================================
// Configuration
// ============================================================================

/// Cooldown policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Cooldown after a rate limit while quota remains
    pub rate_limit_cooldown: Duration,
    /// Cooldown after a rate limit reporting no remaining quota
    pub quota_exhausted_cooldown: Duration,
    /// Cooldown once `failure_threshold` consecutive other failures accumulate
    pub failure_cooldown: Duration,
    /// Consecutive other failures before cooling
    pub failure_threshold: u32,
    /// How long an auth failure disables a credential; `None` until re-enabled
    pub auth_cooldown: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(5 * 3600),
            quota_exhausted_cooldown: Duration::from_secs(10 * 3600),
            failure_cooldown: Duration::from_secs(3600),
            failure_threshold: 5,
            auth_cooldown: None,
        }
    }
}

// ============================================================================
// Errors and Results
// ============================================================================

/// Why `select()` could not hand out a credential
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NoAvailableCredential {
    /// No credentials are configured
    #[error("credential pool is empty")]
    EmptyPool,
    /// Every eligible credential is cooling down
    #[error("all credentials are cooling down; soonest available in {retry_after_ms} ms")]
    AllCooling {
        /// Time until the soonest credential becomes eligible
        retry_after_ms: u64,
    },
    /// Every credential is disabled
    #[error("all credentials are disabled")]
    AllDisabled,
    /// Active credentials exist but every one was excluded by the caller
    #[error("every active credential was already tried")]
    AllExcluded,
}

/// Errors from pool administration
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Secret was empty after normalization
    #[error("credential secret is empty")]
    EmptySecret,
    /// Secret is already in the pool
    #[error("credential {0} already exists")]
    Duplicate(CredentialId),
    /// No credential with this id
    #[error("credential {0} not found")]
    NotFound(CredentialId),
}

/// A credential handed out for one upstream call
#[derive(Clone)]
pub struct CredentialLease {
    /// Credential id
    pub id: CredentialId,
    /// Secret to present upstream
    pub secret: String,
    /// Account tier
    pub tier: Tier,
}

impl CredentialLease {
    /// Loggable preview of the secret
    #[must_use]
    pub fn preview(&self) -> String {
        preview_secret(&self.secret)
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("secret", &self.preview())
            .field("tier", &self.tier)
            .finish()
    }
}

/// Outcome of a batch add
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchAddReport {
    /// Newly added credentials
    pub added: Vec<CredentialId>,
    /// Secrets already present (or repeated within the batch)
    pub duplicates: usize,
    /// Entries empty after normalization
    pub empty: usize,
}

/// Aggregate pool statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Credentials in the pool
    pub total: usize,
    /// Currently Active
    pub active: usize,
    /// Currently Cooling
    pub cooling: usize,
    /// Currently Disabled
    pub disabled: usize,
    /// Successful turns across all credentials
    pub total_requests: u64,
    /// Failures across all credentials
    pub total_failures: u64,
    /// Sum of known remaining quota
    pub remaining_quota: i64,
}

// ============================================================================
// Pool
// ============================================================================

/// Shared pool of upstream credentials
pub struct CredentialPool {
    entries: DashMap<CredentialId, Arc<Mutex<Credential>>>,
    cursor: AtomicUsize,
    next_seq: AtomicU64,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<dyn StatsSink>,
}

struct Candidate {
    id: CredentialId,
    seq: u64,
    last_selected_ms: u64,
    entry: Arc<Mutex<Credential>>,
}

impl CredentialPool {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>, stats: Arc<dyn StatsSink>) -> Self {
        Self {
            entries: DashMap::new(),
            cursor: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            config,
            clock,
            stats,
        }
    }

    /// Cooldown policy in effect
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of credentials
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool has no credentials
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a credential exists
    #[must_use]
    pub fn contains(&self, id: &CredentialId) -> bool {
        self.entries.contains_key(id)
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// Select an Active credential
    ///
    /// # Errors
    ///
    /// Returns [`NoAvailableCredential`] when nothing is Active.
    pub fn select(&self) -> Result<CredentialLease, NoAvailableCredential> {
        self.select_with(None, &[])
    }

    /// Select an Active credential, preferring `affinity` and never returning
    /// anything in `exclude`
    ///
    /// # Errors
    ///
    /// Returns [`NoAvailableCredential`] when no Active credential remains
    /// after exclusions.
    pub fn select_with(
        &self,
        affinity: Option<&CredentialId>,
        exclude: &[CredentialId],
    ) -> Result<CredentialLease, NoAvailableCredential> {
        // A concurrent failure report can flip the chosen credential between
        // the scan and the claim; rescan in that case.
        for _ in 0..=self.entries.len() {
            let candidates = self.scan(exclude)?;
            let chosen = self.choose(&candidates, affinity);

            let now = self.clock.now_ms();
            let mut cred = chosen.entry.lock();
            cred.refresh(now);
            if cred.state != CredentialState::Active {
                continue;
            }
            cred.last_selected_ms = Some(now);
            tracing::debug!(
                credential = %cred.id,
                name = %cred.name,
                affinity = affinity.is_some_and(|a| *a == cred.id),
                "Credential selected"
            );
            return Ok(CredentialLease {
                id: cred.id.clone(),
                secret: cred.secret.clone(),
                tier: cred.tier,
            });
        }

        // Pool changed under us on every pass; report from a fresh scan.
        Err(self
            .scan(exclude)
            .err()
            .unwrap_or(NoAvailableCredential::AllCooling { retry_after_ms: 0 }))
    }

    /// Collect Active, non-excluded credentials, reactivating elapsed ones
    fn scan(&self, exclude: &[CredentialId]) -> Result<Vec<Candidate>, NoAvailableCredential> {
        if self.entries.is_empty() {
            return Err(NoAvailableCredential::EmptyPool);
        }

        let now = self.clock.now_ms();
        let mut candidates = Vec::new();
        let mut soonest: Option<u64> = None;
        let mut excluded = 0usize;
        let mut reactivated = Vec::new();

        let entries: Vec<Arc<Mutex<Credential>>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let mut cred = entry.lock();
            if let Some(previous) = cred.refresh(now) {
                reactivated.push((cred.id.clone(), previous));
            }
            match cred.state {
                CredentialState::Active if exclude.contains(&cred.id) => excluded += 1,
                CredentialState::Active => candidates.push(Candidate {
                    id: cred.id.clone(),
                    seq: cred.seq,
                    last_selected_ms: cred.last_selected_ms.unwrap_or(0),
                    entry: Arc::clone(&entry),
                }),
                CredentialState::Cooling | CredentialState::Disabled => {
                    if let Some(remaining) = cred.remaining_cooldown_ms(now) {
                        soonest = Some(soonest.map_or(remaining, |s| s.min(remaining)));
                    }
                }
            }
        }

        for (id, previous) in reactivated {
            self.stats
                .credential_transition(&id, previous, CredentialState::Active, "cooldown elapsed");
        }

        if candidates.is_empty() {
            if excluded > 0 {
                tracing::debug!(excluded, "Every active credential excluded");
                return Err(NoAvailableCredential::AllExcluded);
            }
            return Err(match soonest {
                Some(retry_after_ms) => {
                    tracing::warn!(retry_after_ms, "All credentials cooling down");
                    NoAvailableCredential::AllCooling { retry_after_ms }
                }
                None => {
                    tracing::warn!("No enabled credentials");
                    NoAvailableCredential::AllDisabled
                }
            });
        }

        candidates.sort_by_key(|c| c.seq);
        Ok(candidates)
    }

    fn choose<'a>(
        &self,
        candidates: &'a [Candidate],
        affinity: Option<&CredentialId>,
    ) -> &'a Candidate {
        if let Some(preferred) = affinity.and_then(|a| candidates.iter().find(|c| c.id == *a)) {
            return preferred;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        // Rotation order beginning at the cursor; min_by_key keeps the first
        // of equal keys, so ties resolve in rotation order.
        candidates
            .iter()
            .cycle()
            .skip(start)
            .take(candidates.len())
            .min_by_key(|c| c.last_selected_ms)
            .unwrap_or(&candidates[0])
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    /// Record a successful turn on a credential
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] if the credential was removed.
    pub fn report_success(&self, id: &CredentialId) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let mut cred = entry.lock();
        cred.request_count += 1;
        cred.consecutive_failures = 0;
        cred.last_used_ms = Some(self.clock.now_ms());
        Ok(())
    }

    /// Record a failed upstream call and apply the cooldown policy
    ///
    /// Returns the credential's state after the report.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] if the credential was removed.
    pub fn report_failure(
        &self,
        id: &CredentialId,
        class: FailureClass,
    ) -> Result<CredentialState, PoolError> {
        let entry = self.entry(id)?;
        let now = self.clock.now_ms();
        let transition = {
            let mut cred = entry.lock();
            cred.refresh(now);
            let from = cred.state;
            cred.failure_count += 1;
            cred.consecutive_failures += 1;
            cred.last_failure = Some(class.to_string());

            let reason = match class {
                // Operator and auth disables outrank a late rate-limit report.
                FailureClass::RateLimited { quota_exhausted } if from == CredentialState::Disabled => {
                    if quota_exhausted {
                        cred.remaining_quota = 0;
                    }
                    None
                }
                FailureClass::RateLimited { quota_exhausted } => {
                    let cooldown = if quota_exhausted {
                        cred.remaining_quota = 0;
                        self.config.quota_exhausted_cooldown
                    } else {
                        self.config.rate_limit_cooldown
                    };
                    cred.state = CredentialState::Cooling;
                    cred.cooldown_until_ms = Some(now.saturating_add(duration_ms(cooldown)));
                    Some(class.to_string())
                }
                FailureClass::AuthFailed => {
                    cred.state = CredentialState::Disabled;
                    cred.cooldown_until_ms = self
                        .config
                        .auth_cooldown
                        .map(|d| now.saturating_add(duration_ms(d)));
                    Some(class.to_string())
                }
                FailureClass::Other
                    if cred.consecutive_failures >= self.config.failure_threshold
                        && cred.state == CredentialState::Active =>
                {
                    let reason = format!("{} consecutive failures", cred.consecutive_failures);
                    cred.state = CredentialState::Cooling;
                    cred.cooldown_until_ms =
                        Some(now.saturating_add(duration_ms(self.config.failure_cooldown)));
                    cred.consecutive_failures = 0;
                    Some(reason)
                }
                FailureClass::Other => None,
            };

            if let Some(reason) = &reason {
                cred.cooldown_reason = Some(reason.clone());
            }
            (from, cred.state, reason)
        };

        let (from, to, reason) = transition;
        if let Some(reason) = reason {
            self.stats.credential_transition(id, from, to, &reason);
        } else {
            tracing::debug!(credential = %id, class = %class, "Credential failure recorded");
        }
        Ok(to)
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Add a credential from a raw (possibly cookie-formatted) secret
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::EmptySecret`] or [`PoolError::Duplicate`].
    pub fn add(
        &self,
        raw_secret: &str,
        name: &str,
        tier: Tier,
    ) -> Result<CredentialId, PoolError> {
        let secret = normalize_secret(raw_secret);
        if secret.is_empty() {
            return Err(PoolError::EmptySecret);
        }
        let mut cred = Credential::new(secret, name, self.clock.now_ms());
        cred.tier = tier;
        cred.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = cred.id.clone();

        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(PoolError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(cred)));
                tracing::info!(credential = %id, name, "Credential added");
                Ok(id)
            }
        }
    }

    /// Add many secrets, skipping empty and duplicate entries
    pub fn add_batch<I, S>(&self, secrets: I) -> BatchAddReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BatchAddReport::default();
        for raw in secrets {
            match self.add(raw.as_ref(), "", Tier::Unknown) {
                Ok(id) => report.added.push(id),
                Err(PoolError::EmptySecret) => report.empty += 1,
                Err(_) => report.duplicates += 1,
            }
        }
        tracing::info!(
            added = report.added.len(),
            duplicates = report.duplicates,
            empty = report.empty,
            "Credential batch processed"
        );
        report
    }

    /// Remove a credential
    pub fn remove(&self, id: &CredentialId) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            tracing::info!(credential = %id, "Credential removed");
        }
        removed
    }

    /// Enable or disable a credential by operator action
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown id.
    pub fn set_enabled(&self, id: &CredentialId, enabled: bool) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let (from, to) = {
            let mut cred = entry.lock();
            let from = cred.state;
            if enabled {
                cred.activate();
                cred.consecutive_failures = 0;
            } else {
                cred.state = CredentialState::Disabled;
                cred.cooldown_until_ms = None;
                cred.cooldown_reason = Some("disabled by operator".to_string());
            }
            (from, cred.state)
        };
        if from != to {
            self.stats.credential_transition(id, from, to, "operator");
        }
        Ok(())
    }

    /// Lift a cooldown immediately
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown id.
    pub fn clear_cooldown(&self, id: &CredentialId) -> Result<(), PoolError> {
        let entry = self.entry(id)?;
        let from = {
            let mut cred = entry.lock();
            let from = cred.state;
            if from == CredentialState::Cooling {
                cred.activate();
            }
            from
        };
        if from == CredentialState::Cooling {
            self.stats
                .credential_transition(id, from, CredentialState::Active, "cooldown cleared");
        }
        Ok(())
    }

    /// Record the remaining quota reported by upstream
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown id.
    pub fn update_quota(&self, id: &CredentialId, remaining: i64) -> Result<(), PoolError> {
        self.entry(id)?.lock().remaining_quota = remaining;
        Ok(())
    }

    /// Record the account tier
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown id.
    pub fn set_tier(&self, id: &CredentialId, tier: Tier) -> Result<(), PoolError> {
        self.entry(id)?.lock().tier = tier;
        Ok(())
    }

    /// Lease a specific credential regardless of rotation (for probing)
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for an unknown id.
    pub fn lease(&self, id: &CredentialId) -> Result<CredentialLease, PoolError> {
        let entry = self.entry(id)?;
        let cred = entry.lock();
        Ok(CredentialLease {
            id: cred.id.clone(),
            secret: cred.secret.clone(),
            tier: cred.tier,
        })
    }

    /// Copy of one credential
    #[must_use]
    pub fn get(&self, id: &CredentialId) -> Option<Credential> {
        self.entries.get(id).map(|e| e.value().lock().clone())
    }

    /// Reset every elapsed cooldown; returns how many were reactivated
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let entries: Vec<Arc<Mutex<Credential>>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut count = 0;
        for entry in entries {
            let transition = {
                let mut cred = entry.lock();
                cred.refresh(now).map(|previous| (cred.id.clone(), previous))
            };
            if let Some((id, previous)) = transition {
                self.stats
                    .credential_transition(&id, previous, CredentialState::Active, "cooldown elapsed");
                count += 1;
            }
        }
        count
    }

    /// Copies of all credentials in insertion order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Credential> {
        let mut all: Vec<Credential> = self.entries.iter().map(|e| e.value().lock().clone()).collect();
        all.sort_by_key(|c| c.seq);
        all
    }

    /// Merge persisted credentials into the pool
    ///
    /// Persisted records replace in-memory records with the same id, so
    /// counters and cooldowns survive a restart.
    pub fn restore(&self, credentials: Vec<Credential>) {
        for mut cred in credentials {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if let Some(existing) = self.entries.get(&cred.id) {
                let mut current = existing.value().lock();
                cred.seq = current.seq;
                *current = cred;
                continue;
            }
            cred.seq = seq;
            self.entries.insert(cred.id.clone(), Arc::new(Mutex::new(cred)));
        }
    }

    /// Aggregate statistics as of now
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let now = self.clock.now_ms();
        let mut stats = PoolStats::default();
        for entry in self.entries.iter() {
            let cred = entry.value().lock();
            stats.total += 1;
            match cred.effective_state(now) {
                CredentialState::Active => stats.active += 1,
                CredentialState::Cooling => stats.cooling += 1,
                CredentialState::Disabled => stats.disabled += 1,
            }
            stats.total_requests += cred.request_count;
            stats.total_failures += cred.failure_count;
            if cred.remaining_quota > 0 {
                stats.remaining_quota += cred.remaining_quota;
            }
        }
        stats
    }

    fn entry(&self, id: &CredentialId) -> Result<Arc<Mutex<Credential>>, PoolError> {
        self.entries
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PoolError::NotFound(id.clone()))
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("credentials", &self.entries.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
