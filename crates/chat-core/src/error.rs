use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConversationId, ConversationLifecycleState};

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Initial or backward page fetch failed.
    Fetch,
    /// Live feed broke or could not be attached.
    Subscription,
    /// Caller lacks permission for the conversation or message.
    Access,
    /// Request payload was rejected before reaching the store.
    InvalidInput,
    /// Operation not allowed in the current lifecycle state.
    InvalidState,
    /// Local store failure.
    Storage,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    /// Construct a new error.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// A page query against the message store failed.
    pub fn fetch_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Fetch, "fetch_failed", message)
    }

    /// The live feed errored or closed unexpectedly.
    pub fn subscription_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Subscription, "subscription_failed", message)
    }

    pub fn conversation_not_found(conversation_id: &ConversationId) -> Self {
        Self::new(
            ErrorCategory::InvalidInput,
            "conversation_not_found",
            format!("conversation not found: {conversation_id}"),
        )
    }

    pub fn message_not_found(message_id: &str) -> Self {
        Self::new(
            ErrorCategory::InvalidInput,
            "message_not_found",
            format!("message not found: {message_id}"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConversationLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::InvalidState,
            "invalid_state_transition",
            format!("cannot run '{action}' while conversation is in state {current:?}"),
        )
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Fetch | ErrorCategory::Subscription | ErrorCategory::Storage
        )
    }
}
