//! Engagement and reply loop: click tracking, reply-intent classification,
//! and the continuation decision for an outreach sequence.
//!
//! Classification is AI-backed when a chat client is configured and always
//! degrades to a deterministic heuristic, so every reply yields a usable
//! intent. Unsubscribe requests arrive from untrusted redirect contexts and
//! are accepted only with a valid HMAC signature.

mod classifier;
mod service;

use thiserror::Error;

use reach_store::StoreError;

pub use classifier::{heuristic_classification, is_hard_negative, strip_markup, ReplyClassifier};
pub use service::{
    unsubscribe_signature, verify_unsubscribe_signature, EngagementService, ReplyOutcome,
    UnsubscribeReceipt, UnsubscribeRequest,
};

#[derive(Debug, Error)]
pub enum EngagementError {
    #[error("unsubscribe signature mismatch")]
    SignatureMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}
