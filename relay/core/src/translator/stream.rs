//! Stream Translator
//!
//! Turns the upstream event stream of one turn into caller-facing frames.
//!
//! # Reasoning block
//!
//! When reasoning or search activity is surfaced it is wrapped in a single
//! `<think>` block:
//!
//! ```text
//! <think>
//! ...reasoning and [search] lines...
//! </think>
//!
//! ...answer...
//! ```
//!
//! The opening delimiter rides on the first surfaced reasoning or search
//! frame and the closing delimiter on the first answer frame. Once the answer
//! has started the block is never reopened: later reasoning and search
//! fragments are dropped. Suppressed kinds are dropped, never buffered.
//!
//! Concatenating the text of every frame gives the composed answer, which is
//! what non-streaming callers receive.

use crate::error::RelayError;
use crate::messages::CredentialId;
use crate::upstream::{SearchActivity, UpstreamError, UpstreamEvent};

const THINK_OPEN: &str = "<think>\n";
const THINK_CLOSE: &str = "\n</think>\n\n";

/// Which fragment kinds reach the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Surface reasoning fragments
    pub show_thinking: bool,
    /// Surface search activity
    pub show_search: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            show_thinking: true,
            show_search: true,
        }
    }
}

/// A caller-facing piece of a turn
#[derive(Clone, Debug)]
pub enum StreamFrame {
    /// Answer text
    TextDelta(String),
    /// Reasoning text
    ThinkingDelta(String),
    /// Rendered search activity
    SearchEvent(String),
    /// The turn completed; nothing follows
    Done,
    /// The turn failed; nothing follows
    Error(RelayError),
}

impl StreamFrame {
    /// Text carried by the frame, if any
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::TextDelta(t) | Self::ThinkingDelta(t) | Self::SearchEvent(t) => Some(t),
            Self::Done | Self::Error(_) => None,
        }
    }

    /// Whether this frame ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Reasoning,
    Answering,
}

/// Per-turn translator state
#[derive(Debug)]
pub struct StreamTranslator {
    config: TranslatorConfig,
    credential: CredentialId,
    phase: Phase,
    conversation_id: Option<String>,
    last_turn_id: Option<String>,
    transcript: String,
    streamed_text: bool,
    completed: bool,
    failure: Option<UpstreamError>,
}

impl StreamTranslator {
    /// Translator for a turn served by `credential`
    #[must_use]
    pub fn new(config: TranslatorConfig, credential: CredentialId) -> Self {
        Self {
            config,
            credential,
            phase: Phase::Idle,
            conversation_id: None,
            last_turn_id: None,
            transcript: String::new(),
            streamed_text: false,
            completed: false,
            failure: None,
        }
    }

    /// Seed the ids the turn continues from
    #[must_use]
    pub fn with_progress(mut self, conversation_id: &str, last_turn_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self.last_turn_id = Some(last_turn_id.to_string());
        self
    }

    /// Translate one upstream event
    pub fn translate(&mut self, event: UpstreamEvent) -> Vec<StreamFrame> {
        if self.is_finished() {
            return Vec::new();
        }
        match event {
            UpstreamEvent::Conversation { conversation_id } => {
                self.conversation_id = Some(conversation_id);
                Vec::new()
            }
            UpstreamEvent::Acknowledged { turn_id } => {
                self.last_turn_id = Some(turn_id);
                Vec::new()
            }
            UpstreamEvent::Token {
                text,
                thinking: true,
            } => {
                if !self.config.show_thinking {
                    return Vec::new();
                }
                self.reasoning(text).map(StreamFrame::ThinkingDelta).into_iter().collect()
            }
            UpstreamEvent::Token {
                text,
                thinking: false,
            } => {
                self.streamed_text = true;
                vec![StreamFrame::TextDelta(self.answer(&text))]
            }
            UpstreamEvent::Search(activity) => {
                if !self.config.show_search {
                    return Vec::new();
                }
                let line = match activity {
                    SearchActivity::Query(query) => format!("[search] {query}\n"),
                    SearchActivity::Results { count } => format!("[search] {count} results\n"),
                };
                self.reasoning(line).map(StreamFrame::SearchEvent).into_iter().collect()
            }
            UpstreamEvent::Final {
                turn_id,
                message,
                image_urls,
            } => {
                self.last_turn_id = Some(turn_id);
                self.completed = true;
                let mut text = String::new();
                if !self.streamed_text {
                    text.push_str(&message);
                }
                for url in &image_urls {
                    text.push_str(&format!("\n![image]({url})"));
                }
                let mut frames = Vec::new();
                if !text.is_empty() || self.phase == Phase::Reasoning {
                    frames.push(StreamFrame::TextDelta(self.answer(&text)));
                }
                frames.push(StreamFrame::Done);
                frames
            }
            UpstreamEvent::Failed(error) => {
                self.failure = Some(error.clone());
                vec![StreamFrame::Error(RelayError::from_upstream(
                    &self.credential,
                    error,
                ))]
            }
        }
    }

    /// Frames owed once the upstream channel closes
    ///
    /// A channel that closes before a final event means the connection was
    /// lost; the turn is reported as a protocol failure.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        if self.is_finished() {
            return Vec::new();
        }
        let error = UpstreamError::Protocol("stream ended before the final response".into());
        self.failure = Some(error.clone());
        vec![StreamFrame::Error(RelayError::from_upstream(
            &self.credential,
            error,
        ))]
    }

    /// Frame text with the reasoning block opened if needed; `None` once the
    /// answer has started
    fn reasoning(&mut self, text: String) -> Option<String> {
        let framed = match self.phase {
            Phase::Answering => return None,
            Phase::Idle => {
                self.phase = Phase::Reasoning;
                format!("{THINK_OPEN}{text}")
            }
            Phase::Reasoning => text,
        };
        self.transcript.push_str(&framed);
        Some(framed)
    }

    /// Frame text with the reasoning block closed if open
    fn answer(&mut self, text: &str) -> String {
        let framed = if self.phase == Phase::Reasoning {
            format!("{THINK_CLOSE}{text}")
        } else {
            text.to_string()
        };
        self.phase = Phase::Answering;
        self.transcript.push_str(&framed);
        framed
    }

    /// Upstream conversation id, once known
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Most recent acknowledged upstream turn id
    #[must_use]
    pub fn last_turn_id(&self) -> Option<&str> {
        self.last_turn_id.as_deref()
    }

    /// Everything emitted so far, concatenated
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Whether upstream finished the turn
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// The upstream failure that ended the turn, if any
    #[must_use]
    pub fn failure(&self) -> Option<&UpstreamError> {
        self.failure.as_ref()
    }

    fn is_finished(&self) -> bool {
        self.completed || self.failure.is_some()
    }
}
