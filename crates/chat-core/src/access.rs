//! Conversation access and per-message permission rules.

use serde::{Deserialize, Serialize};

use crate::{
    error::{ChatError, ErrorCategory},
    types::{ConversationInfo, Message, Session, TaskStatus},
};

/// Why a conversation only accepts reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReadOnlyReason {
    /// The task has not started yet.
    TaskPending,
    /// The task is completed; its chat is an archive.
    TaskCompleted,
}

impl ReadOnlyReason {
    pub fn hint(self) -> &'static str {
        match self {
            Self::TaskPending => "task is pending and cannot be chatted in yet",
            Self::TaskCompleted => "task completed, chat is read-only",
        }
    }
}

/// Resolved access for the viewing session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly(ReadOnlyReason),
}

impl AccessMode {
    pub fn can_write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Actions offered for a single message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageAction {
    Copy,
    Edit,
    Delete,
}

/// Resolve what `session` may do in the conversation described by `info`.
pub fn resolve_access(session: &Session, info: &ConversationInfo) -> Result<AccessMode, ChatError> {
    if !info.members.iter().any(|member| *member == session.user_id) {
        return Err(ChatError::new(
            ErrorCategory::Access,
            "not_a_member",
            format!("{} is not a member of {}", session.user_id, info.id),
        ));
    }

    Ok(match info.task_status {
        Some(TaskStatus::Pending) => AccessMode::ReadOnly(ReadOnlyReason::TaskPending),
        Some(TaskStatus::Completed) => AccessMode::ReadOnly(ReadOnlyReason::TaskCompleted),
        Some(TaskStatus::InProgress) | None => AccessMode::ReadWrite,
    })
}

/// Actions the session may take on `message` under `access`.
pub fn allowed_actions(session: &Session, access: AccessMode, message: &Message) -> Vec<MessageAction> {
    let mut actions = vec![MessageAction::Copy];
    if access.can_write() && !message.is_deleted && message.sender_id == session.user_id {
        actions.push(MessageAction::Delete);
        actions.push(MessageAction::Edit);
    }
    actions
}

/// Validate and normalize a new message body.
pub fn prepare_send(access: AccessMode, content: &str) -> Result<String, ChatError> {
    ensure_writable(access)?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::new(
            ErrorCategory::InvalidInput,
            "empty_message",
            "message content is empty",
        ));
    }
    Ok(trimmed.to_owned())
}

/// Check that `session` may edit or delete `message`.
pub fn ensure_can_modify(
    session: &Session,
    access: AccessMode,
    message: &Message,
) -> Result<(), ChatError> {
    ensure_writable(access)?;
    if message.sender_id != session.user_id {
        return Err(ChatError::new(
            ErrorCategory::Access,
            "not_message_owner",
            "cannot modify other users' messages",
        ));
    }
    if message.is_deleted {
        return Err(ChatError::new(
            ErrorCategory::InvalidInput,
            "message_deleted",
            format!("message {} is already deleted", message.id),
        ));
    }
    Ok(())
}

fn ensure_writable(access: AccessMode) -> Result<(), ChatError> {
    match access {
        AccessMode::ReadWrite => Ok(()),
        AccessMode::ReadOnly(reason) => Err(ChatError::new(
            ErrorCategory::Access,
            "read_only_conversation",
            reason.hint(),
        )),
    }
}
