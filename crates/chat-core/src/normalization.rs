use crate::{
    error::ChatError,
    types::{ConversationEvent, SendAck},
};

/// Send/edit/delete result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Write succeeded for the given message.
    Success { message_id: String },
    /// Write failed with error details.
    Failure { error: ChatError },
}

impl From<Result<String, ChatError>> for SendOutcome {
    fn from(result: Result<String, ChatError>) -> Self {
        match result {
            Ok(message_id) => Self::Success { message_id },
            Err(error) => Self::Failure { error },
        }
    }
}

/// Convert a write outcome to a stable `ConversationEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> ConversationEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message_id } => ConversationEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => ConversationEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `ConversationEvent::Error`.
pub fn normalize_error(error: ChatError) -> ConversationEvent {
    let recoverable = error.is_recoverable();
    ConversationEvent::Error {
        code: error.code,
        message: error.message,
        recoverable,
        retry_after_ms: error.retry_after_ms,
    }
}
