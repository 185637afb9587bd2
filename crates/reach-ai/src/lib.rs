//! Chat-completion client used by the reply classifier.
//!
//! The engine only ever needs short text completions (one classification per
//! inbound reply), so the surface is deliberately small: plain-text messages,
//! optional JSON mode, and a single `LlmClient` trait that the classifier and
//! the tests implement. The HTTP client targets any OpenAI-compatible
//! `/chat/completions` endpoint and retries transient failures with bounded
//! backoff.

mod openai;
mod retry;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use retry::{
    backoff_delay_ms, is_retryable_http_error, new_request_id, retry_after_hint_ms,
    retry_delay_ms, should_retry_status, within_retry_budget,
};
pub use types::{AiError, ChatRequest, ChatResponse, ChatUsage, LlmClient, Message, MessageRole};
