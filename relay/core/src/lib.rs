//! Relay Core - Stateful Chat-Completion Relay
//!
//! This crate lets clients that speak the stateless OpenAI-style
//! `chat.completions` protocol hold a real multi-turn conversation against an
//! upstream chat service that is stateful internally, rate-limits each
//! account, and can only move a conversation between accounts by sharing it
//! and cloning the share.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Request router (external)                     │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ ChatRequest / ChatResponse
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                         RELAY CORE                                │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                   RequestOrchestrator                       │  │
//! │  │  ┌─────────────────────────────────────────────────────┐   │  │
//! │  │  │               ContinuationDriver                     │   │  │
//! │  │  │  ┌────────────┐ ┌────────────┐ ┌─────────────────┐  │   │  │
//! │  │  │  │ Credential │ │  Context   │ │     Stream      │  │   │  │
//! │  │  │  │    Pool    │ │   Store    │ │   Translator    │  │   │  │
//! │  │  │  └────────────┘ └────────────┘ └─────────────────┘  │   │  │
//! │  │  └──────────────────────────┬──────────────────────────┘   │  │
//! │  └─────────────────────────────┼──────────────────────────────┘  │
//! │                                │ UpstreamClient                   │
//! └────────────────────────────────┼─────────────────────────────────┘
//!                                  │ NDJSON over HTTPS
//!                          ┌───────┴────────┐
//!                          │    Upstream    │
//!                          └────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`RequestOrchestrator`]: entry point for chat requests and operator actions
//! - [`ContinuationDriver`]: decides new / same-credential / cross-credential
//! - [`CredentialPool`]: credential health, cooldowns and selection
//! - [`ContextStore`]: conversation sessions, fingerprints and per-handle locks
//! - [`StreamTranslator`]: upstream events to caller frames
//! - [`UpstreamClient`]: the upstream seam ([`GrokClient`], [`ScriptedUpstream`])
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{load_config, ChatMessage, ChatRequest, ChatResponse, RequestOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let relay = RequestOrchestrator::builder(load_config()?).build()?;
//!     relay.start().await?;
//!
//!     let request = ChatRequest::new("grok-3", vec![ChatMessage::user("Hello!")]);
//!     if let ChatResponse::Complete { completion, .. } = relay.chat_completion(request).await? {
//!         println!("{} ({})", completion.content(), completion.conversation_id);
//!     }
//!
//!     relay.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`clock`]: injectable time source
//! - [`config`]: TOML / environment / CLI configuration
//! - [`context`]: conversation sessions and the context store
//! - [`credentials`]: credential records and the pool
//! - [`driver`]: the continuation state machine
//! - [`error`]: the caller-visible error taxonomy
//! - [`messages`]: chat request types and identifiers
//! - [`models`]: the model registry
//! - [`orchestrator`]: request composition and lifecycle
//! - [`persistence`]: durable credentials, sessions and request log
//! - [`stats`]: counters, latency and the request log
//! - [`translator`]: frame translation and OpenAI-compatible encoding
//! - [`upstream`]: the upstream client seam

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod context;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod messages;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod stats;
pub mod translator;
pub mod upstream;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ContextStore, ConversationSession, Fingerprint, StoreConfig, StoreStats};
pub use credentials::{
    Credential, CredentialLease, CredentialPool, CredentialState, FailureClass,
    NoAvailableCredential, PoolConfig, PoolError, PoolStats, Tier,
};
pub use driver::{compose_prompt, ContinuationDriver, ContinuationPath, DriverConfig, FrameStream};
pub use error::{ErrorBody, RelayError, RequestFailure};
pub use messages::{
    ChatMessage, ChatRequest, ContentPart, ConversationHandle, CredentialId, MessageContent, Role,
    TraceId,
};
pub use models::{ModelRegistry, ModelSpec, ResolvedModel};
pub use orchestrator::{
    ChatResponse, HealthReport, RefreshProgress, RefreshReport, RefreshResult, RefreshStatus,
    RelayBuilder, RequestOrchestrator,
};
pub use persistence::{JsonFileStore, MemoryStore, StateStore, StateSync, StoreError};
pub use stats::{MetricsSnapshot, RelayMetrics, RelayStats, RequestLog, RequestRecord, StatsSink};
pub use translator::{
    ChatCompletion, ChatCompletionChunk, ChunkEncoder, ModelCard, ModelList, StreamFrame,
    StreamTranslator, TranslatorConfig,
};
pub use upstream::{
    QuotaStatus, GrokClient, ScriptedUpstream, UpstreamClient, UpstreamConfig, UpstreamError,
    UpstreamEvent,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, CredentialSeed, RelayConfig, RelayToml,
};
