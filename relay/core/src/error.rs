//! Relay Error Taxonomy
//!
//! Every failure a caller can observe is a [`RelayError`]. Each variant has a
//! stable machine-readable code and an HTTP status hint; [`ErrorBody`] is the
//! structured form handed to callers together with the request's trace id.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::NoAvailableCredential;
use crate::messages::{ConversationHandle, CredentialId, TraceId};
use crate::upstream::UpstreamError;

/// Errors surfaced by the relay
#[derive(Clone, Debug, Error)]
pub enum RelayError {
    /// No Active credential could be selected
    #[error("no credential available: {0}")]
    CredentialExhausted(#[from] NoAvailableCredential),

    /// Upstream rate-limited the credential (after the rotation retry)
    #[error("upstream rate limited credential {credential}: {message}")]
    UpstreamRateLimited {
        /// Credential that was rejected
        credential: CredentialId,
        /// Upstream detail
        message: String,
    },

    /// Upstream rejected the credential (after the rotation retry)
    #[error("upstream rejected credential {credential}: {message}")]
    UpstreamAuthFailed {
        /// Credential that was rejected
        credential: CredentialId,
        /// Upstream detail
        message: String,
    },

    /// Upstream sent something we could not interpret
    #[error("malformed upstream response: {0}")]
    UpstreamProtocolError(String),

    /// Upstream could not be reached, timed out, or failed server-side
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Explicit handle is unknown or expired
    #[error("conversation {0} not found or expired")]
    SessionNotFound(ConversationHandle),

    /// Share-link clone failed and the full-resend fallback failed too
    #[error("conversation clone failed: {0}")]
    CloneFailed(String),

    /// Caller went away mid-stream
    #[error("stream aborted by client")]
    StreamAborted,

    /// Continuation requested without a handle
    #[error("conversation_id is required to continue a conversation")]
    MissingConversationId,

    /// Model id is neither registered nor an alias
    #[error("model {0} not found")]
    ModelNotFound(String),

    /// Request is structurally unusable
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Durable state could not be read or written
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Relay configuration is unusable
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialExhausted(_) => "credential_exhausted",
            Self::UpstreamRateLimited { .. } => "upstream_rate_limited",
            Self::UpstreamAuthFailed { .. } => "upstream_auth_failed",
            Self::UpstreamProtocolError(_) => "upstream_protocol_error",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::SessionNotFound(_) => "session_not_found",
            Self::CloneFailed(_) => "clone_failed",
            Self::StreamAborted => "stream_aborted",
            Self::MissingConversationId => "missing_conversation_id",
            Self::ModelNotFound(_) => "model_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Persistence(_) => "persistence_error",
            Self::Config(_) => "config_error",
        }
    }

    /// HTTP status a router should map this error to
    #[must_use]
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::CredentialExhausted(_) | Self::UpstreamRateLimited { .. } => 429,
            Self::UpstreamAuthFailed { .. }
            | Self::UpstreamProtocolError(_)
            | Self::UpstreamUnavailable(_)
            | Self::CloneFailed(_) => 502,
            Self::SessionNotFound(_) | Self::ModelNotFound(_) => 404,
            Self::MissingConversationId | Self::InvalidRequest(_) => 400,
            Self::StreamAborted => 499,
            Self::Persistence(_) | Self::Config(_) => 500,
        }
    }

    /// Whether the fault lies with the caller's request
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        let capacity = matches!(
            self,
            Self::CredentialExhausted(_) | Self::UpstreamRateLimited { .. }
        );
        (400..500).contains(&self.status_hint()) && !capacity
    }

    /// Map an upstream failure observed on `credential`
    #[must_use]
    pub fn from_upstream(credential: &CredentialId, error: UpstreamError) -> Self {
        match error {
            UpstreamError::RateLimited { message, .. } => Self::UpstreamRateLimited {
                credential: credential.clone(),
                message,
            },
            UpstreamError::AuthFailed(message) => Self::UpstreamAuthFailed {
                credential: credential.clone(),
                message,
            },
            UpstreamError::Protocol(message) => Self::UpstreamProtocolError(message),
            UpstreamError::Unavailable(message) => Self::UpstreamUnavailable(message),
        }
    }

    /// Structured body for the caller
    #[must_use]
    pub fn to_body(&self, trace_id: &TraceId) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            trace_id: trace_id.clone(),
        }
    }
}

/// Structured error returned to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Trace id of the failed request
    pub trace_id: TraceId,
}

/// A failed request: the error plus the trace id assigned to the request
#[derive(Clone, Debug, Error)]
#[error("{error} (trace {trace_id})")]
pub struct RequestFailure {
    /// Trace id of the request
    pub trace_id: TraceId,
    /// What went wrong
    #[source]
    pub error: RelayError,
}

impl RequestFailure {
    /// Attach a trace id to an error
    #[must_use]
    pub fn new(trace_id: TraceId, error: RelayError) -> Self {
        Self { trace_id, error }
    }

    /// Structured body for the caller
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        self.error.to_body(&self.trace_id)
    }
}
