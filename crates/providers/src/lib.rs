//! LLM provider adapters.
//!
//! The core only ever sees the [`LlmProvider`] trait: a streaming completion
//! function over provider-agnostic messages and tool schemas, plus a batch
//! embedding function. The one concrete adapter speaks the OpenAI
//! chat-completions wire contract.

mod openai;
mod retry;
mod sse;
mod traits;
mod util;

pub use openai::OpenAiProvider;
pub use retry::Backoff;
pub use traits::{
    chat_json, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider,
};
