use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one conversation: a group-wide chat or a chat scoped to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationId {
    /// Group-wide chat.
    Group {
        /// Owning group ID.
        group_id: String,
    },
    /// Chat attached to a single task inside a group.
    Task {
        /// Owning group ID.
        group_id: String,
        /// Task ID within the group.
        task_id: String,
    },
}

impl ConversationId {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self::Group {
            group_id: group_id.into(),
        }
    }

    pub fn task(group_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self::Task {
            group_id: group_id.into(),
            task_id: task_id.into(),
        }
    }

    /// Group that owns the conversation, for membership checks.
    pub fn group_id(&self) -> &str {
        match self {
            Self::Group { group_id } | Self::Task { group_id, .. } => group_id,
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task { .. })
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group { group_id } => write!(f, "groups/{group_id}"),
            Self::Task { group_id, task_id } => write!(f, "groups/{group_id}/tasks/{task_id}"),
        }
    }
}

/// Canonical chat message shared by the store, the live feed and the reducer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Stable message ID; the de-duplication key.
    pub id: String,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author user ID.
    pub sender_id: String,
    /// Text body. May be empty for tombstones.
    pub content: String,
    /// Writer-assigned send time in milliseconds since Unix epoch.
    ///
    /// Clients stamp this locally, so it is not monotonic across senders.
    pub timestamp_ms: i64,
    /// Tombstone flag. Deleted messages stay in the timeline.
    pub is_deleted: bool,
}

impl Message {
    /// Total display order key: timestamp first, ID breaks ties.
    pub fn order_key(&self) -> (i64, &str) {
        (self.timestamp_ms, self.id.as_str())
    }
}

/// One live-feed change. Every variant carries the full message and is applied
/// as an upsert keyed by `Message::id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageEvent {
    /// A message was sent.
    Created(Message),
    /// A message body was edited.
    Edited(Message),
    /// A message was marked deleted.
    Tombstoned(Message),
}

impl MessageEvent {
    pub fn message(&self) -> &Message {
        match self {
            Self::Created(message) | Self::Edited(message) | Self::Tombstoned(message) => message,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Created(message) | Self::Edited(message) | Self::Tombstoned(message) => message,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Edited(_) => "edited",
            Self::Tombstoned(_) => "tombstoned",
        }
    }
}

/// The user viewing a conversation. Injected rather than read from globals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Workflow status of a task conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task created but not started; chat is not open yet.
    Pending,
    /// Task in progress; chat is open.
    InProgress,
    /// Task finished; chat is kept as a read-only record.
    Completed,
}

/// Conversation metadata used for access checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationInfo {
    pub id: ConversationId,
    /// Display title (group name or task title).
    pub title: String,
    /// Member user IDs of the owning group.
    pub members: Vec<String>,
    /// Task status for task conversations, `None` for group chats.
    pub task_status: Option<TaskStatus>,
}

/// Lifecycle of a conversation view driven by a runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationLifecycleState {
    /// Not opened yet, or the last open attempt failed.
    Cold,
    /// Access check and initial page fetch are running.
    Opening,
    /// Initial page loaded and the live feed is attached.
    Live,
    /// View torn down; late arrivals are discarded.
    Disposed,
}

/// Ordered snapshot plus scroll intents, emitted after every reducer mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineUpdate {
    pub conversation_id: ConversationId,
    /// What produced this update.
    pub cause: UpdateCause,
    /// Full ordered, de-duplicated sequence.
    pub sequence: Vec<Message>,
    /// Viewer was near the bottom before a live merge.
    pub should_auto_scroll: bool,
    /// Index to pin the viewport to after older history was prepended.
    pub scroll_anchor_index: Option<usize>,
    /// No further history exists before the oldest loaded message.
    pub all_older_loaded: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpdateCause {
    InitialPage,
    LiveBatch,
    OlderPage,
}

/// Acknowledgement for send/edit/delete commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Frontend-provided transaction ID.
    pub client_txn_id: String,
    /// Affected message ID on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Commands accepted by a conversation runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationCommand {
    /// Check access, load the newest page and attach the live feed.
    Open,
    /// Fetch the next page of older history.
    LoadOlder,
    /// Report the visible index range of the message list.
    UpdateViewport {
        first_visible: usize,
        last_visible: usize,
    },
    /// Send a new text message.
    Send {
        client_txn_id: String,
        content: String,
    },
    /// Replace the body of an own message.
    Edit {
        client_txn_id: String,
        message_id: String,
        new_content: String,
    },
    /// Tombstone an own message.
    Delete {
        client_txn_id: String,
        message_id: String,
    },
    /// Tear the view down and cancel the live feed.
    Close,
}

impl ConversationCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::LoadOlder => "load_older",
            Self::UpdateViewport { .. } => "update_viewport",
            Self::Send { .. } => "send",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::Close => "close",
        }
    }
}

/// Events emitted by a conversation runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Runtime lifecycle transition.
    StateChanged { state: ConversationLifecycleState },
    /// Access mode resolved during open.
    AccessResolved { access: crate::access::AccessMode },
    /// Timeline changed.
    TimelineUpdated(TimelineUpdate),
    /// Send/edit/delete acknowledgement.
    SendAck(SendAck),
    /// Recoverable or terminal error for UI messaging.
    Error {
        code: String,
        message: String,
        recoverable: bool,
        retry_after_ms: Option<u64>,
    },
}
