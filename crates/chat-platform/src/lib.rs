//! In-memory chat backend implementing every collaborator trait from
//! `chat-core`: paged message reads, a push live feed, message writes and the
//! conversation directory. Used by tests and the smoke driver.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chat_core::{
    ChatError, ConversationDirectory, ConversationId, ConversationInfo, ErrorCategory, LiveFeed,
    Message, MessageEvent, MessageStore, MessageWriter, PageQuery, Subscription,
};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

const FEED_CAPACITY: usize = 1_024;
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryError {
    #[error("poisoned lock")]
    Poisoned,
    #[error("conversation not registered: {0}")]
    UnknownConversation(ConversationId),
    #[error("message not found: {0}")]
    UnknownMessage(String),
}

impl From<InMemoryError> for ChatError {
    fn from(err: InMemoryError) -> Self {
        match err {
            InMemoryError::Poisoned => ChatError::new(
                ErrorCategory::Storage,
                "storage_poisoned",
                "in-memory backend lock poisoned",
            ),
            InMemoryError::UnknownConversation(conversation_id) => {
                ChatError::conversation_not_found(&conversation_id)
            }
            InMemoryError::UnknownMessage(message_id) => ChatError::message_not_found(&message_id),
        }
    }
}

/// Change or fault pushed to every live subscription.
#[derive(Debug, Clone)]
enum FeedSignal {
    Change(MessageEvent),
    Fault {
        conversation_id: ConversationId,
        error: ChatError,
    },
}

#[derive(Debug, Default)]
struct ConversationRecord {
    info: Option<ConversationInfo>,
    messages: HashMap<String, Message>,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Shared in-memory document store plus live feed.
///
/// Clones share state. `subscribe` spawns a forwarding task and therefore
/// must be called from within a tokio runtime.
#[derive(Clone)]
pub struct InMemoryChatBackend {
    conversations: Arc<RwLock<HashMap<ConversationId, ConversationRecord>>>,
    feed: broadcast::Sender<FeedSignal>,
    clock: Clock,
    fetch_delay: Option<Duration>,
    fetch_faults: Arc<Mutex<VecDeque<ChatError>>>,
    subscribe_faults: Arc<Mutex<VecDeque<ChatError>>>,
    fetch_calls: Arc<AtomicUsize>,
    subscribe_calls: Arc<AtomicUsize>,
}

impl Default for InMemoryChatBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChatBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            conversations: Arc::default(),
            feed,
            clock: Arc::new(system_time_ms),
            fetch_delay: None,
            fetch_faults: Arc::default(),
            subscribe_faults: Arc::default(),
            fetch_calls: Arc::default(),
            subscribe_calls: Arc::default(),
        }
    }

    /// Replace the clock used to stamp new messages.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Delay every page fetch, to exercise in-flight behavior.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Register or replace conversation metadata.
    pub fn add_conversation(&self, info: ConversationInfo) -> Result<(), InMemoryError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|_| InMemoryError::Poisoned)?;
        let id = info.id.clone();
        conversations.entry(id).or_default().info = Some(info);
        Ok(())
    }

    /// Seed a message without publishing it on the live feed.
    pub fn insert_message(&self, message: Message) -> Result<(), InMemoryError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|_| InMemoryError::Poisoned)?;
        conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .messages
            .insert(message.id.clone(), message);
        Ok(())
    }

    /// Seed `count` messages with ids `m0001..` and timestamps `1..=count`.
    pub fn seed_sequential(
        &self,
        conversation_id: &ConversationId,
        sender_id: &str,
        count: usize,
    ) -> Result<Vec<Message>, InMemoryError> {
        let messages: Vec<Message> = (1..=count)
            .map(|n| Message {
                id: format!("m{n:04}"),
                conversation_id: conversation_id.clone(),
                sender_id: sender_id.to_owned(),
                content: format!("message {n}"),
                timestamp_ms: n as i64,
                is_deleted: false,
            })
            .collect();
        for message in &messages {
            self.insert_message(message.clone())?;
        }
        Ok(messages)
    }

    /// Make the next page fetch fail with `error`.
    pub fn fail_next_fetch(&self, error: ChatError) -> Result<(), InMemoryError> {
        push_fault(&self.fetch_faults, error)
    }

    /// Make the next `subscribe` call fail with `error`.
    pub fn fail_next_subscribe(&self, error: ChatError) -> Result<(), InMemoryError> {
        push_fault(&self.subscribe_faults, error)
    }

    /// Deliver `error` to every live subscription of `conversation_id` and end
    /// those subscriptions.
    pub fn break_feed(&self, conversation_id: &ConversationId, error: ChatError) {
        warn!(%conversation_id, code = %error.code, "breaking live feed");
        let _ = self.feed.send(FeedSignal::Fault {
            conversation_id: conversation_id.clone(),
            error,
        });
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of stored messages in `conversation_id`, tombstones included.
    pub fn message_count(&self, conversation_id: &ConversationId) -> Result<usize, InMemoryError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| InMemoryError::Poisoned)?;
        Ok(conversations
            .get(conversation_id)
            .map_or(0, |record| record.messages.len()))
    }

    fn snapshot(
        &self,
        conversation_id: &ConversationId,
        since_ms: Option<i64>,
    ) -> Result<Vec<MessageEvent>, InMemoryError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| InMemoryError::Poisoned)?;
        let Some(record) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<&Message> = record
            .messages
            .values()
            .filter(|message| since_ms.is_none_or(|since| message.timestamp_ms >= since))
            .collect();
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(messages
            .into_iter()
            .cloned()
            .map(|message| {
                if message.is_deleted {
                    MessageEvent::Tombstoned(message)
                } else {
                    MessageEvent::Created(message)
                }
            })
            .collect())
    }

    fn update_message<F>(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        apply: F,
    ) -> Result<Message, InMemoryError>
    where
        F: FnOnce(&mut Message),
    {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|_| InMemoryError::Poisoned)?;
        let record = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| InMemoryError::UnknownConversation(conversation_id.clone()))?;
        let message = record
            .messages
            .get_mut(message_id)
            .ok_or_else(|| InMemoryError::UnknownMessage(message_id.to_owned()))?;
        apply(message);
        Ok(message.clone())
    }

    fn publish(&self, event: MessageEvent) {
        trace!(
            conversation_id = %event.message().conversation_id,
            message_id = %event.message().id,
            kind = event.kind(),
            "publishing live event"
        );
        let _ = self.feed.send(FeedSignal::Change(event));
    }
}

impl MessageStore for InMemoryChatBackend {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Message>, ChatError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = take_fault(&self.fetch_faults)? {
            warn!(conversation_id = %query.conversation_id, code = %error.code, "injected fetch failure");
            return Err(error);
        }

        let conversations = self
            .conversations
            .read()
            .map_err(|_| InMemoryError::Poisoned)?;
        let Some(record) = conversations.get(&query.conversation_id) else {
            return Ok(Vec::new());
        };
        let mut page: Vec<Message> = record
            .messages
            .values()
            .filter(|message| query.matches(message))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        page.truncate(query.limit);

        debug!(
            conversation_id = %query.conversation_id,
            before_ms = ?query.before_ms,
            limit = query.limit,
            returned = page.len(),
            "page fetched"
        );
        Ok(page)
    }
}

impl MessageWriter for InMemoryChatBackend {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, ChatError> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.to_owned(),
            content: content.to_owned(),
            timestamp_ms: (self.clock)(),
            is_deleted: false,
        };
        {
            let mut conversations = self
                .conversations
                .write()
                .map_err(|_| InMemoryError::Poisoned)?;
            let record = conversations
                .get_mut(conversation_id)
                .filter(|record| record.info.is_some())
                .ok_or_else(|| InMemoryError::UnknownConversation(conversation_id.clone()))?;
            record.messages.insert(message.id.clone(), message.clone());
        }
        self.publish(MessageEvent::Created(message.clone()));
        Ok(message)
    }

    async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
        new_content: &str,
    ) -> Result<Message, ChatError> {
        let message = self.update_message(conversation_id, message_id, |message| {
            message.content = new_content.to_owned();
        })?;
        self.publish(MessageEvent::Edited(message.clone()));
        Ok(message)
    }

    async fn mark_deleted(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> Result<Message, ChatError> {
        let message = self.update_message(conversation_id, message_id, |message| {
            message.is_deleted = true;
        })?;
        self.publish(MessageEvent::Tombstoned(message.clone()));
        Ok(message)
    }
}

impl ConversationDirectory for InMemoryChatBackend {
    async fn conversation_info(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationInfo, ChatError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| InMemoryError::Poisoned)?;
        conversations
            .get(conversation_id)
            .and_then(|record| record.info.clone())
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))
    }
}

impl LiveFeed for InMemoryChatBackend {
    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since_ms: Option<i64>,
    ) -> Result<Subscription, ChatError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = take_fault(&self.subscribe_faults)? {
            warn!(%conversation_id, code = %error.code, "injected subscribe failure");
            return Err(error);
        }

        // Attach before taking the snapshot so no write falls between the two.
        let mut signals = self.feed.subscribe();
        let snapshot = self.snapshot(conversation_id, since_ms)?;
        let (sender, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
        debug!(
            %conversation_id,
            ?since_ms,
            snapshot_len = snapshot.len(),
            "live feed attached"
        );
        sender.try_send(Ok(snapshot))?;

        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = sender.closed() => break,
                    signal = signals.recv() => signal,
                };
                match signal {
                    Ok(FeedSignal::Change(event)) => {
                        if event.message().conversation_id != conversation_id {
                            continue;
                        }
                        if sender.send(Ok(vec![event])).await.is_err() {
                            break;
                        }
                    }
                    Ok(FeedSignal::Fault {
                        conversation_id: target,
                        error,
                    }) => {
                        if target != conversation_id {
                            continue;
                        }
                        let _ = sender.send(Err(error)).await;
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%conversation_id, skipped, "live feed lagged");
                        let _ = sender
                            .send(Err(ChatError::subscription_failed(format!(
                                "live feed lagged by {skipped} events"
                            ))))
                            .await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!(%conversation_id, "live feed forwarder stopped");
        });

        Ok(subscription)
    }
}

fn push_fault(queue: &Mutex<VecDeque<ChatError>>, error: ChatError) -> Result<(), InMemoryError> {
    queue
        .lock()
        .map_err(|_| InMemoryError::Poisoned)?
        .push_back(error);
    Ok(())
}

fn take_fault(queue: &Mutex<VecDeque<ChatError>>) -> Result<Option<ChatError>, InMemoryError> {
    Ok(queue
        .lock()
        .map_err(|_| InMemoryError::Poisoned)?
        .pop_front())
}

fn system_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
