//! Conversation context: sessions, fingerprints, and the shared store.

pub mod fingerprint;
pub mod session;
pub mod store;

pub use fingerprint::{lookup_fingerprint, request_key, storage_fingerprint, Fingerprint};
pub use session::{ConversationSession, TurnReplay};
pub use store::{ContextStore, HandleGuard, StoreConfig, StoreStats};
