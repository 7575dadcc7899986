//! Credential Record
//!
//! A credential is one upstream account secret plus its health bookkeeping.
//! State is stored, but cooldown expiry is evaluated lazily: a Cooling (or
//! time-boxed Disabled) credential whose deadline has passed is treated as
//! Active the next time anyone looks at it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::messages::CredentialId;

/// Account tier of a credential
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Not checked yet
    #[default]
    Unknown,
    /// Free account
    Free,
    /// Paid subscription
    Super,
}

impl Tier {
    /// Parse a tier name, case-insensitively
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "free" | "basic" => Some(Self::Free),
            "super" | "premium" => Some(Self::Super),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Free => write!(f, "free"),
            Self::Super => write!(f, "super"),
        }
    }
}

/// Availability of a credential
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialState {
    /// Eligible for selection
    Active,
    /// Suspended until a deadline
    Cooling,
    /// Suspended until an operator re-enables it (or an optional deadline)
    Disabled,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cooling => write!(f, "cooling"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// How an upstream call failed, from the pool's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Upstream throttled the account
    RateLimited {
        /// Upstream reported no remaining quota
        quota_exhausted: bool,
    },
    /// Upstream rejected the secret
    AuthFailed,
    /// Anything else attributable to this credential
    Other,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited {
                quota_exhausted: false,
            } => write!(f, "rate_limited"),
            Self::RateLimited {
                quota_exhausted: true,
            } => write!(f, "quota_exhausted"),
            Self::AuthFailed => write!(f, "auth_failed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A credential and its health bookkeeping
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Stable id derived from the secret
    pub id: CredentialId,
    /// Normalized secret
    pub secret: String,
    /// Operator-facing label
    #[serde(default)]
    pub name: String,
    /// Account tier
    #[serde(default)]
    pub tier: Tier,
    /// Stored availability
    pub state: CredentialState,
    /// Deadline after which a Cooling/Disabled credential becomes Active again
    #[serde(default)]
    pub cooldown_until_ms: Option<u64>,
    /// Why the credential is not Active
    #[serde(default)]
    pub cooldown_reason: Option<String>,
    /// Successful turns served
    #[serde(default)]
    pub request_count: u64,
    /// Failed upstream calls
    #[serde(default)]
    pub failure_count: u64,
    /// Failures since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Last successful use
    #[serde(default)]
    pub last_used_ms: Option<u64>,
    /// Last time the pool handed this credential out
    #[serde(default)]
    pub last_selected_ms: Option<u64>,
    /// Classification of the most recent failure
    #[serde(default)]
    pub last_failure: Option<String>,
    /// Remaining upstream quota, -1 when unknown
    #[serde(default = "unknown_quota")]
    pub remaining_quota: i64,
    /// When the credential was added
    pub created_ms: u64,
    /// Insertion order, used for rotation
    #[serde(default)]
    pub seq: u64,
}

fn unknown_quota() -> i64 {
    -1
}

impl Credential {
    /// Create an Active credential from an already-normalized secret
    pub fn new(secret: impl Into<String>, name: impl Into<String>, now_ms: u64) -> Self {
        let secret = secret.into();
        Self {
            id: CredentialId::from_secret(&secret),
            secret,
            name: name.into(),
            tier: Tier::Unknown,
            state: CredentialState::Active,
            cooldown_until_ms: None,
            cooldown_reason: None,
            request_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_used_ms: None,
            last_selected_ms: None,
            last_failure: None,
            remaining_quota: -1,
            created_ms: now_ms,
            seq: 0,
        }
    }

    /// Display label: the name, or the secret preview when unnamed
    #[must_use]
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            preview_secret(&self.secret)
        } else {
            self.name.clone()
        }
    }

    /// Reactivate if the cooldown deadline has passed
    ///
    /// Returns the previous state when a transition happened.
    pub fn refresh(&mut self, now_ms: u64) -> Option<CredentialState> {
        match (self.state, self.cooldown_until_ms) {
            (CredentialState::Cooling | CredentialState::Disabled, Some(until))
                if until <= now_ms =>
            {
                let previous = self.state;
                self.activate();
                Some(previous)
            }
            _ => None,
        }
    }

    /// State as of `now_ms`, without mutating
    #[must_use]
    pub fn effective_state(&self, now_ms: u64) -> CredentialState {
        match (self.state, self.cooldown_until_ms) {
            (CredentialState::Active, _) => CredentialState::Active,
            (_, Some(until)) if until <= now_ms => CredentialState::Active,
            (state, _) => state,
        }
    }

    /// Milliseconds until this credential is eligible, if it has a deadline
    #[must_use]
    pub fn remaining_cooldown_ms(&self, now_ms: u64) -> Option<u64> {
        match self.effective_state(now_ms) {
            CredentialState::Active => None,
            _ => self.cooldown_until_ms.map(|until| until.saturating_sub(now_ms)),
        }
    }

    pub(crate) fn activate(&mut self) {
        self.state = CredentialState::Active;
        self.cooldown_until_ms = None;
        self.cooldown_reason = None;
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("secret", &preview_secret(&self.secret))
            .field("tier", &self.tier)
            .field("state", &self.state)
            .field("cooldown_until_ms", &self.cooldown_until_ms)
            .field("request_count", &self.request_count)
            .field("failure_count", &self.failure_count)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

/// Strip cookie syntax and whitespace from a pasted secret
///
/// Operators paste secrets as `sso=abc`, with surrounding whitespace, or with
/// a trailing `;`. All of those normalize to `abc`.
#[must_use]
pub fn normalize_secret(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_prefix = trimmed.strip_prefix("sso=").unwrap_or(trimmed);
    let without_suffix = without_prefix.split(';').next().unwrap_or(without_prefix);
    without_suffix.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Loggable preview of a secret: first 8 and last 4 characters
#[must_use]
pub fn preview_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().min(8));
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
