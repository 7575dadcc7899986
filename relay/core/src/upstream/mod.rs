//! Upstream Chat Service
//!
//! Access to the upstream service through the [`UpstreamClient`] trait.
//!
//! # Implementations
//!
//! - **Grok**: the real service over HTTPS ([`GrokClient`])
//! - **Scripted**: an in-process model of upstream for tests and offline runs
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::upstream::{GrokClient, UpstreamConfig, UpstreamClient, UpstreamTurn};
//!
//! let client = GrokClient::new(&UpstreamConfig::default())?;
//! let turn = UpstreamTurn::new("Hello!", "grok-3", "MODEL_MODE_AUTO");
//! let rx = client.create_conversation(&lease, &turn).await?;
//! ```

mod grok;
mod scripted;
mod traits;

pub use grok::{classify_status, GrokClient, NdjsonParser, UpstreamConfig, DEFAULT_BASE_URL};
pub use scripted::{CallKind, RecordedCall, ScriptedUpstream};
pub use traits::{
    ClonedConversation, QuotaStatus, SearchActivity, UpstreamClient, UpstreamError,
    UpstreamEvent, UpstreamTurn,
};
