//! Upstream Client Traits
//!
//! The relay talks to exactly one upstream chat service, but the driver only
//! ever sees this trait. Implementations handle wire details (endpoints,
//! auth headers, NDJSON framing) and report every outcome as either a
//! classified [`UpstreamError`] or an ordered stream of [`UpstreamEvent`]s.
//!
//! # Event stream
//!
//! `create_conversation` and `append_response` resolve once upstream has
//! accepted the request. Events then arrive on the returned channel in
//! upstream order. The channel closes after `Final` or `Failed`; a channel
//! that closes without either means the connection dropped.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::credentials::{CredentialLease, FailureClass, Tier};

// ============================================================================
// Errors
// ============================================================================

/// Classified upstream failure
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// HTTP 429 or an equivalent in-band error
    #[error("rate limited: {message}")]
    RateLimited {
        /// Upstream reported no remaining quota for this account
        quota_exhausted: bool,
        /// Upstream detail
        message: String,
    },
    /// HTTP 401/403: the secret is invalid or revoked
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Upstream answered with something we cannot decode
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Transport failure, timeout, or a 5xx
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl UpstreamError {
    /// How the pool should account for this failure
    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::RateLimited {
                quota_exhausted, ..
            } => FailureClass::RateLimited {
                quota_exhausted: *quota_exhausted,
            },
            Self::AuthFailed(_) => FailureClass::AuthFailed,
            Self::Protocol(_) | Self::Unavailable(_) => FailureClass::Other,
        }
    }

    /// Whether retrying with a different credential can help
    #[must_use]
    pub fn is_rotatable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::AuthFailed(_))
    }
}

// ============================================================================
// Requests and Events
// ============================================================================

/// One user turn as sent upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTurn {
    /// Message text (full prompt for a new conversation, newest user message
    /// when appending)
    pub message: String,
    /// Upstream model name
    pub model_name: String,
    /// Upstream model mode
    pub mode: String,
}

impl UpstreamTurn {
    /// Create a turn
    pub fn new(
        message: impl Into<String>,
        model_name: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            model_name: model_name.into(),
            mode: mode.into(),
        }
    }
}

/// Search activity reported alongside a turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchActivity {
    /// Upstream issued a web search
    Query(String),
    /// Upstream received search results
    Results {
        /// Number of results
        count: usize,
    },
}

/// One event from an upstream turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Upstream assigned (or confirmed) the conversation id
    Conversation {
        /// Upstream conversation id
        conversation_id: String,
    },
    /// Upstream acknowledged a turn id (the user turn or the response in
    /// progress)
    Acknowledged {
        /// Upstream turn id
        turn_id: String,
    },
    /// A fragment of the answer or of the reasoning
    Token {
        /// Fragment text
        text: String,
        /// Whether the fragment is reasoning
        thinking: bool,
    },
    /// Search activity
    Search(SearchActivity),
    /// The turn finished
    Final {
        /// Id of the completed response turn
        turn_id: String,
        /// Full answer as upstream composed it
        message: String,
        /// Images generated during the turn
        image_urls: Vec<String>,
    },
    /// The turn failed mid-stream
    Failed(UpstreamError),
}

/// Ids of a conversation cloned from a share link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClonedConversation {
    /// New conversation id, owned by the cloning credential
    pub conversation_id: String,
    /// Id of the newest turn in the clone
    pub turn_id: String,
}

/// Account information reported by upstream for one credential
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaStatus {
    /// Remaining quota, `-1` when upstream did not say
    pub remaining_quota: i64,
    /// Account tier
    pub tier: Tier,
}

// ============================================================================
// Client Trait
// ============================================================================

/// Upstream chat service
///
/// Every call is scoped to one credential; conversation and turn ids are only
/// meaningful under the credential that created them.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Client name for logs
    fn name(&self) -> &'static str;

    /// Start a new conversation with `turn` as its first message
    async fn create_conversation(
        &self,
        lease: &CredentialLease,
        turn: &UpstreamTurn,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError>;

    /// Append `turn` to an existing conversation after `parent_turn_id`
    async fn append_response(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        parent_turn_id: &str,
        turn: &UpstreamTurn,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError>;

    /// Publish a conversation up to `turn_id`; returns the share link id
    async fn create_share_link(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<String, UpstreamError>;

    /// Adopt a copy of a shared conversation under `lease`
    async fn clone_share_link(
        &self,
        lease: &CredentialLease,
        share_link: &str,
    ) -> Result<ClonedConversation, UpstreamError>;

    /// Query remaining quota and account tier
    async fn check_quota(&self, lease: &CredentialLease) -> Result<QuotaStatus, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_mapping() {
        let limited = UpstreamError::RateLimited {
            quota_exhausted: true,
            message: "slow down".into(),
        };
        assert_eq!(
            limited.failure_class(),
            FailureClass::RateLimited {
                quota_exhausted: true
            }
        );
        assert_eq!(
            UpstreamError::AuthFailed("bad".into()).failure_class(),
            FailureClass::AuthFailed
        );
        assert_eq!(
            UpstreamError::Unavailable("503".into()).failure_class(),
            FailureClass::Other
        );
    }

    #[test]
    fn test_only_credential_failures_rotate() {
        assert!(UpstreamError::AuthFailed(String::new()).is_rotatable());
        assert!(UpstreamError::RateLimited {
            quota_exhausted: false,
            message: String::new()
        }
        .is_rotatable());
        assert!(!UpstreamError::Protocol(String::new()).is_rotatable());
        assert!(!UpstreamError::Unavailable(String::new()).is_rotatable());
    }

    #[test]
    fn test_name_outlives_client() {
        let client: std::sync::Arc<dyn UpstreamClient> =
            std::sync::Arc::new(crate::upstream::ScriptedUpstream::new());
        let name: &'static str = client.name();
        drop(client);
        assert_eq!(name, "Scripted");
    }
}
