//! Core conversation contract shared by runtimes, backends and views.
//!
//! This crate defines the message and command/event protocol, the paginated
//! timeline reducer, scroll and access policies, retry and lifecycle helpers,
//! and the collaborator traits a backend implements.

/// Conversation access and per-message permissions.
pub mod access;
/// Async command/event channel primitives.
pub mod channel;
/// Stable error payload and categories.
pub mod error;
/// Write-outcome and error normalization into events.
pub mod normalization;
/// Backoff policy used by retry loops.
pub mod retry;
/// Conversation lifecycle state machine.
pub mod state_machine;
/// Store, feed, writer and directory traits plus the subscription handle.
pub mod store;
/// Paginated stream reducer.
pub mod timeline;
/// Protocol types (messages, commands, events).
pub mod types;
/// Visible range and scroll policies.
pub mod viewport;

pub use access::{AccessMode, MessageAction, ReadOnlyReason, allowed_actions, resolve_access};
pub use channel::{ConversationChannelError, ConversationChannels, EventStream, RuntimeEndpoint};
pub use error::{ChatError, ErrorCategory};
pub use normalization::{SendOutcome, normalize_error, normalize_send_outcome};
pub use retry::RetryPolicy;
pub use state_machine::ConversationStateMachine;
pub use store::{
    ChatBackend, ConversationDirectory, FeedItem, FeedSender, LiveFeed, MessageStore,
    MessageWriter, PageQuery, Subscription,
};
pub use timeline::{MergeResult, OlderPage, PAGE_SIZE, PageResult, SkipReason, TimelineReducer};
pub use types::{
    ConversationCommand, ConversationEvent, ConversationId, ConversationInfo,
    ConversationLifecycleState, Message, MessageEvent, SendAck, Session, TaskStatus,
    TimelineUpdate, UpdateCause,
};
pub use viewport::{ScrollPolicy, Viewport};
