//! OpenAI-Compatible Encoding
//!
//! Wire types for the external chat-completion protocol and the SSE encoder
//! used for streamed responses. Both completion types carry a
//! `conversation_id` extension field holding the conversation handle.
//!
//! # SSE Format
//!
//! ```text
//! data: {"object":"chat.completion.chunk","choices":[{"delta":{"role":"assistant","content":"Hi"}}],...}
//!
//! data: {"object":"chat.completion.chunk","choices":[{"delta":{},"finish_reason":"stop"}],...}
//!
//! data: [DONE]
//! ```

use serde::{Deserialize, Serialize};

use super::stream::StreamFrame;
use crate::error::ErrorBody;
use crate::messages::{ConversationHandle, TraceId};

/// SSE terminator
pub const SSE_DONE: &str = "data: [DONE]\n\n";

const ASSISTANT: &str = "assistant";
const STOP: &str = "stop";

// ============================================================================
// Completion Types
// ============================================================================

/// Message inside a non-streamed completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    /// Always `assistant`
    pub role: String,
    /// Composed answer
    pub content: String,
}

/// Choice inside a non-streamed completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Choice index
    pub index: u32,
    /// The answer
    pub message: CompletionMessage,
    /// Why generation stopped
    pub finish_reason: Option<String>,
}

/// Non-streamed chat completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Completion id
    pub id: String,
    /// Always `chat.completion`
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model requested by the caller
    pub model: String,
    /// Single choice
    pub choices: Vec<CompletionChoice>,
    /// Handle to continue this conversation with
    pub conversation_id: ConversationHandle,
}

impl ChatCompletion {
    /// Completion holding `content` as the single choice
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        created: i64,
        handle: ConversationHandle,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created,
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: ASSISTANT.to_string(),
                    content: content.into(),
                },
                finish_reason: Some(STOP.to_string()),
            }],
            conversation_id: handle,
        }
    }

    /// Text of the first choice
    #[must_use]
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map_or("", |c| c.message.content.as_str())
    }
}

/// Incremental content of a streamed chunk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Set on the first chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// New text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Choice inside a streamed chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// New content
    pub delta: ChunkDelta,
    /// Set on the final chunk
    pub finish_reason: Option<String>,
}

/// One streamed chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion id, shared by every chunk of a response
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model requested by the caller
    pub model: String,
    /// Single choice
    pub choices: Vec<ChunkChoice>,
    /// Handle to continue this conversation with
    pub conversation_id: ConversationHandle,
}

// ============================================================================
// Model Listing
// ============================================================================

/// One entry of the model listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCard {
    /// Model id
    pub id: String,
    /// Always `model`
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Owner
    pub owned_by: String,
}

/// Model listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelList {
    /// Always `list`
    pub object: String,
    /// Entries
    pub data: Vec<ModelCard>,
}

impl ModelList {
    /// Listing of `cards`
    #[must_use]
    pub fn new(data: Vec<ModelCard>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

// ============================================================================
// SSE Encoder
// ============================================================================

#[derive(Serialize)]
struct SseError<'a> {
    error: &'a ErrorBody,
}

/// Encodes the frames of one response as SSE events
#[derive(Debug)]
pub struct ChunkEncoder {
    id: String,
    model: String,
    created: i64,
    handle: ConversationHandle,
    trace_id: TraceId,
    sent_role: bool,
}

impl ChunkEncoder {
    /// Encoder for one response
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        created: i64,
        handle: ConversationHandle,
        trace_id: TraceId,
    ) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created,
            handle,
            trace_id,
            sent_role: false,
        }
    }

    /// Completion id shared by every chunk
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chunk for `frame`, or `None` for frames that carry nothing
    #[must_use]
    pub fn chunk(&mut self, frame: &StreamFrame) -> Option<ChatCompletionChunk> {
        let (content, finish_reason) = match frame {
            StreamFrame::Done => (None, Some(STOP.to_string())),
            StreamFrame::Error(_) => return None,
            other => match other.text() {
                Some(text) if !text.is_empty() => (Some(text.to_string()), None),
                _ => return None,
            },
        };
        let role = if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some(ASSISTANT.to_string())
        };
        Some(ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { role, content },
                finish_reason,
            }],
            conversation_id: self.handle.clone(),
        })
    }

    /// SSE text for `frame`; `Done` also emits the terminator
    #[must_use]
    pub fn encode(&mut self, frame: &StreamFrame) -> Option<String> {
        if let StreamFrame::Error(error) = frame {
            let body = error.to_body(&self.trace_id);
            return serde_json::to_string(&SseError { error: &body })
                .ok()
                .map(|json| format!("data: {json}\n\n{SSE_DONE}"));
        }
        let chunk = self.chunk(frame)?;
        let json = serde_json::to_string(&chunk).ok()?;
        let mut out = format!("data: {json}\n\n");
        if matches!(frame, StreamFrame::Done) {
            out.push_str(SSE_DONE);
        }
        Some(out)
    }
}

/// Fresh `chatcmpl-` id
#[must_use]
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
