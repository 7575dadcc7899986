//! Chat Messages and Identifiers
//!
//! Inbound request types in the external chat-completion shape, plus the
//! identifier newtypes shared across the relay. Identifiers are opaque
//! strings on the wire; the newtypes keep them from being mixed up in code.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Identifiers
// ============================================================================

/// External conversation handle, stable for the life of a session
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHandle(pub String);

impl ConversationHandle {
    /// Generate a fresh handle
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conv-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw handle
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-request trace identifier returned to callers for correlation
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a fresh trace id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("trace-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential identifier
///
/// Derived from the normalized secret so the same secret maps to the same id
/// across restarts, without the id revealing the secret.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(pub String);

impl CredentialId {
    /// Derive the id for a normalized secret
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self(hex::encode(&digest[..6]))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CredentialId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Chat Messages
// ============================================================================

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System / developer instructions
    #[serde(alias = "developer")]
    System,
    /// End-user input
    User,
    /// Model output from an earlier turn
    Assistant,
    /// Tool result
    Tool,
}

impl Role {
    /// Lowercase wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One part of a multimodal message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text {
        /// The text
        text: String,
    },
    /// Image reference
    ImageUrl {
        /// Image location
        image_url: ImageUrl,
    },
}

/// Image location inside a content part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL or data URI
    pub url: String,
}

/// Message content: a bare string or a list of parts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content
    Text(String),
    /// Multimodal parts
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text carried by this content; image parts contribute nothing
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::ImageUrl { .. } => None,
                    })
                    .collect();
                texts.join("\n")
            }
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A single chat message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role
    pub role: Role,
    /// Content
    #[serde(default)]
    pub content: MessageContent,
}

impl ChatMessage {
    /// Create a message with plain text content
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Text of this message
    #[must_use]
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Inbound chat-completion request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Requested model identifier
    pub model: String,
    /// Full message list as sent by the client
    pub messages: Vec<ChatMessage>,
    /// Whether the caller wants incremental frames
    #[serde(default)]
    pub stream: bool,
    /// Handle of a conversation to continue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationHandle>,
}

impl ChatRequest {
    /// Create a non-streaming request
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            conversation_id: None,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Continue a known conversation
    #[must_use]
    pub fn with_conversation(mut self, handle: ConversationHandle) -> Self {
        self.conversation_id = Some(handle);
        self
    }

    /// The newest user message, which is what a continuation sends upstream
    #[must_use]
    pub fn latest_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}
