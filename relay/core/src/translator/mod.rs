//! Stream Translation
//!
//! Upstream events in, caller-facing frames out ([`StreamTranslator`]), and
//! the OpenAI-compatible encoding of those frames ([`openai`]).

pub mod openai;
mod stream;

pub use openai::{
    completion_id, ChatCompletion, ChatCompletionChunk, ChunkEncoder, ModelCard, ModelList,
    SSE_DONE,
};
pub use stream::{StreamFrame, StreamTranslator, TranslatorConfig};
