//! Collaborator contracts the timeline depends on: page queries, the live
//! feed, message writes and conversation metadata.
//!
//! Implementations are injected; nothing here reaches for process-wide
//! handles.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ChatError,
    types::{ConversationId, ConversationInfo, Message, MessageEvent},
};

/// One backward page request. Results are always newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub conversation_id: ConversationId,
    /// Exclusive upper bound on `timestamp_ms`; `None` asks for the newest page.
    pub before_ms: Option<i64>,
    pub limit: usize,
}

impl PageQuery {
    pub fn newest(conversation_id: ConversationId, limit: usize) -> Self {
        Self {
            conversation_id,
            before_ms: None,
            limit,
        }
    }

    pub fn older_than(conversation_id: ConversationId, before_ms: i64, limit: usize) -> Self {
        Self {
            conversation_id,
            before_ms: Some(before_ms),
            limit,
        }
    }

    /// Whether `message` falls inside this query's range.
    pub fn matches(&self, message: &Message) -> bool {
        message.conversation_id == self.conversation_id
            && self
                .before_ms
                .is_none_or(|before| message.timestamp_ms < before)
    }
}

/// Read side of the message store.
pub trait MessageStore: Send + Sync {
    /// Fetch up to `query.limit` messages ordered by timestamp descending.
    ///
    /// Tombstoned messages are included.
    fn fetch_page(
        &self,
        query: &PageQuery,
    ) -> impl Future<Output = Result<Vec<Message>, ChatError>> + Send;
}

/// Write side of the message store. Effects come back through the live feed.
pub trait MessageWriter: Send + Sync {
    fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;

    fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        new_content: &str,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;

    fn mark_deleted(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;
}

/// Conversation metadata lookup used by access checks.
pub trait ConversationDirectory: Send + Sync {
    fn conversation_info(
        &self,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<ConversationInfo, ChatError>> + Send;
}

/// Push subscription source for live upserts.
pub trait LiveFeed: Send + Sync {
    /// Attach to a conversation. The first batch carries every message with
    /// `timestamp_ms >= since_ms` (all messages when `None`); later batches
    /// carry incremental changes.
    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since_ms: Option<i64>,
    ) -> Result<Subscription, ChatError>;
}

/// Everything a conversation runtime needs from a backend.
pub trait ChatBackend: MessageStore + MessageWriter + ConversationDirectory + LiveFeed {}

impl<T> ChatBackend for T where T: MessageStore + MessageWriter + ConversationDirectory + LiveFeed {}

/// Item delivered by a subscription: a batch of changes or a feed failure.
pub type FeedItem = Result<Vec<MessageEvent>, ChatError>;

/// Receiving half of a live feed. Cancelled explicitly or on drop.
#[derive(Debug)]
pub struct Subscription {
    batches: mpsc::Receiver<FeedItem>,
    cancel: CancellationToken,
}

/// Producer half handed to feed implementations.
#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<FeedItem>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a connected producer/subscription pair.
    pub fn channel(buffer: usize) -> (FeedSender, Subscription) {
        let (tx, batches) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            FeedSender {
                tx,
                cancel: cancel.clone(),
            },
            Subscription { batches, cancel },
        )
    }

    /// Wait for the next batch. Returns `None` once cancelled or when the
    /// producer goes away.
    pub async fn next_batch(&mut self) -> Option<FeedItem> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.batches.recv() => item,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl FeedSender {
    /// Deliver one feed item. Fails once the subscriber cancelled or dropped.
    pub async fn send(&self, item: FeedItem) -> Result<(), ChatError> {
        if self.cancel.is_cancelled() {
            return Err(ChatError::subscription_failed("subscription cancelled"));
        }
        self.tx
            .send(item)
            .await
            .map_err(|_| ChatError::subscription_failed("subscriber went away"))
    }

    /// Non-blocking variant used for the initial snapshot.
    pub fn try_send(&self, item: FeedItem) -> Result<(), ChatError> {
        if self.cancel.is_cancelled() {
            return Err(ChatError::subscription_failed("subscription cancelled"));
        }
        self.tx
            .try_send(item)
            .map_err(|err| ChatError::subscription_failed(format!("feed buffer rejected batch: {err}")))
    }

    /// Resolves when the subscriber cancels or drops its handle.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}
