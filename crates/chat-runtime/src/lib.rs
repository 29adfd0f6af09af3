//! Per-conversation async runtime.
//!
//! One tokio task owns a [`TimelineReducer`] and applies everything to it in
//! order: view commands, backward page completions and live feed batches.
//! Views talk to it through [`ConversationHandle`].

use std::{future, sync::Arc};

use chat_core::{
    AccessMode, ChatBackend, ChatError, ConversationChannelError, ConversationChannels,
    ConversationCommand, ConversationEvent, ConversationId, ConversationLifecycleState,
    ConversationStateMachine, EventStream, Message, PAGE_SIZE, RetryPolicy, RuntimeEndpoint,
    ScrollPolicy, Session, Subscription, TimelineReducer, TimelineUpdate, UpdateCause, Viewport,
    access::{ensure_can_modify, prepare_send, resolve_access},
    normalize_error, normalize_send_outcome,
    store::FeedItem,
};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, trace, warn};

const FETCH_COMPLETION_BUFFER: usize = 8;

/// Tuning for one conversation runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Messages per page for the initial load and backward pages.
    pub page_size: usize,
    /// Backoff for live feed re-subscription and fetch retry hints.
    pub retry_policy: RetryPolicy,
    pub command_buffer: usize,
    pub event_buffer: usize,
    pub scroll_policy: ScrollPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            retry_policy: RetryPolicy::default(),
            command_buffer: 64,
            event_buffer: 256,
            scroll_policy: ScrollPolicy::default(),
        }
    }
}

/// Cloneable view-side handle to a running conversation.
#[derive(Clone, Debug)]
pub struct ConversationHandle {
    conversation_id: ConversationId,
    channels: ConversationChannels,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub async fn send(&self, command: ConversationCommand) -> Result<(), ConversationChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn a runtime for `conversation_id` viewed by `session`.
///
/// The runtime starts `Cold`; send [`ConversationCommand::Open`] to load it.
/// It stops after `Close` or once every handle is dropped.
pub fn spawn_conversation<B>(
    backend: Arc<B>,
    session: Session,
    conversation_id: ConversationId,
    config: RuntimeConfig,
) -> ConversationHandle
where
    B: ChatBackend + 'static,
{
    let (channels, endpoint) =
        ConversationChannels::new(config.command_buffer, config.event_buffer);
    let runtime = ConversationRuntime::new(
        backend,
        session,
        conversation_id.clone(),
        config,
        endpoint,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ConversationHandle {
        conversation_id,
        channels,
    }
}

struct ConversationRuntime<B> {
    backend: Arc<B>,
    session: Session,
    config: RuntimeConfig,
    endpoint: RuntimeEndpoint,
    state_machine: ConversationStateMachine,
    timeline: TimelineReducer,
    access: Option<AccessMode>,
    subscription: Option<Subscription>,
    resubscribe_at: Option<Instant>,
    resubscribe_attempt: u32,
    older_failures: u32,
    older_tx: mpsc::Sender<Result<Vec<Message>, ChatError>>,
    older_rx: mpsc::Receiver<Result<Vec<Message>, ChatError>>,
}

impl<B> ConversationRuntime<B>
where
    B: ChatBackend + 'static,
{
    fn new(
        backend: Arc<B>,
        session: Session,
        conversation_id: ConversationId,
        config: RuntimeConfig,
        endpoint: RuntimeEndpoint,
    ) -> Self {
        let timeline = TimelineReducer::with_page_size(conversation_id, config.page_size)
            .with_scroll_policy(config.scroll_policy);
        let (older_tx, older_rx) = mpsc::channel(FETCH_COMPLETION_BUFFER);
        Self {
            backend,
            session,
            config,
            endpoint,
            state_machine: ConversationStateMachine::default(),
            timeline,
            access: None,
            subscription: None,
            resubscribe_at: None,
            resubscribe_attempt: 0,
            older_failures: 0,
            older_tx,
            older_rx,
        }
    }

    async fn run(mut self) {
        info!(conversation_id = %self.timeline.conversation_id(), "conversation runtime started");
        loop {
            tokio::select! {
                command = self.endpoint.commands.recv() => {
                    let Some(command) = command else {
                        debug!("all conversation handles dropped");
                        self.teardown();
                        break;
                    };
                    if let Err(err) = self.handle_command(command).await {
                        self.emit(normalize_error(err));
                    }
                    if self.state_machine.state() == ConversationLifecycleState::Disposed {
                        break;
                    }
                }
                Some(fetched) = self.older_rx.recv() => self.handle_older_page(fetched),
                item = next_feed_item(&mut self.subscription) => self.handle_feed_item(item),
                _ = resubscribe_timer(self.resubscribe_at) => {
                    self.resubscribe_at = None;
                    self.attach_feed();
                }
            }
        }
        info!(conversation_id = %self.timeline.conversation_id(), "conversation runtime stopped");
    }

    async fn handle_command(&mut self, command: ConversationCommand) -> Result<(), ChatError> {
        trace!(kind = command.kind(), "conversation command");
        match command {
            ConversationCommand::Open => self.handle_open().await,
            ConversationCommand::LoadOlder => self.handle_load_older(),
            ConversationCommand::UpdateViewport {
                first_visible,
                last_visible,
            } => self.handle_update_viewport(first_visible, last_visible),
            ConversationCommand::Send {
                client_txn_id,
                content,
            } => {
                self.handle_send(client_txn_id, content).await;
                Ok(())
            }
            ConversationCommand::Edit {
                client_txn_id,
                message_id,
                new_content,
            } => {
                self.handle_edit(client_txn_id, message_id, new_content)
                    .await;
                Ok(())
            }
            ConversationCommand::Delete {
                client_txn_id,
                message_id,
            } => {
                self.handle_delete(client_txn_id, message_id).await;
                Ok(())
            }
            ConversationCommand::Close => self.handle_close(),
        }
    }

    async fn handle_open(&mut self) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(&ConversationCommand::Open)?;
        self.commit_transition(candidate, transition_events);

        match self.open_timeline().await {
            Ok(()) => {
                self.finish_open(true);
                self.attach_feed();
                Ok(())
            }
            Err(err) => {
                self.finish_open(false);
                Err(err)
            }
        }
    }

    async fn open_timeline(&mut self) -> Result<(), ChatError> {
        let conversation_id = self.timeline.conversation_id().clone();
        let info = self.backend.conversation_info(&conversation_id).await?;
        let access = resolve_access(&self.session, &info)?;
        self.access = Some(access);
        self.emit(ConversationEvent::AccessResolved { access });

        let page = self.timeline.load_initial_page(self.backend.as_ref()).await?;
        debug!(
            %conversation_id,
            fetched = page.fetched,
            all_older_loaded = page.all_older_loaded,
            "conversation opened"
        );
        self.emit_timeline(UpdateCause::InitialPage, false, None);
        Ok(())
    }

    fn finish_open(&mut self, success: bool) {
        match self.state_machine.on_open_result(success) {
            Ok(event) => self.emit(event),
            Err(err) => self.emit(normalize_error(err)),
        }
    }

    fn handle_load_older(&mut self) -> Result<(), ChatError> {
        let (_candidate, _events) = self.validate_transition(&ConversationCommand::LoadOlder)?;
        self.start_older_fetch();
        Ok(())
    }

    fn handle_update_viewport(
        &mut self,
        first_visible: usize,
        last_visible: usize,
    ) -> Result<(), ChatError> {
        let (_candidate, _events) =
            self.validate_transition(&ConversationCommand::UpdateViewport {
                first_visible,
                last_visible,
            })?;
        self.timeline
            .set_viewport(Viewport::new(first_visible, last_visible));
        if self.timeline.wants_older_page() {
            self.start_older_fetch();
        }
        Ok(())
    }

    fn start_older_fetch(&mut self) {
        let query = match self.timeline.begin_older_page() {
            Ok(query) => query,
            Err(reason) => {
                trace!(?reason, "older page not requested");
                return;
            }
        };

        let backend = Arc::clone(&self.backend);
        let older_tx = self.older_tx.clone();
        tokio::spawn(async move {
            let fetched = backend.fetch_page(&query).await;
            let _ = older_tx.send(fetched).await;
        });
    }

    fn handle_older_page(&mut self, fetched: Result<Vec<Message>, ChatError>) {
        match self.timeline.complete_older_page(fetched) {
            Ok(Some(page)) => {
                self.older_failures = 0;
                self.emit_timeline(UpdateCause::OlderPage, false, page.scroll_anchor_index);
            }
            Ok(None) => {}
            Err(err) => {
                let delay = self
                    .config
                    .retry_policy
                    .delay_for_attempt(self.older_failures, err.retry_after_ms);
                self.older_failures = self.older_failures.saturating_add(1);
                let err = match delay {
                    Some(delay) => err.with_retry_after(delay),
                    None => err,
                };
                self.emit(normalize_error(err));
            }
        }
    }

    async fn handle_send(&mut self, client_txn_id: String, content: String) {
        let outcome = self.send_message(&content).await;
        self.emit(normalize_send_outcome(client_txn_id, outcome.into()));
    }

    async fn send_message(&mut self, content: &str) -> Result<String, ChatError> {
        self.validate_transition(&ConversationCommand::Send {
            client_txn_id: String::new(),
            content: String::new(),
        })?;
        let access = self.require_access()?;
        let content = prepare_send(access, content)?;
        let message = self
            .backend
            .send_message(self.timeline.conversation_id(), &self.session.user_id, &content)
            .await?;
        Ok(message.id)
    }

    async fn handle_edit(&mut self, client_txn_id: String, message_id: String, new_content: String) {
        let outcome = self.edit_message(&message_id, &new_content).await;
        self.emit(normalize_send_outcome(client_txn_id, outcome.into()));
    }

    async fn edit_message(&mut self, message_id: &str, new_content: &str) -> Result<String, ChatError> {
        self.validate_transition(&ConversationCommand::Edit {
            client_txn_id: String::new(),
            message_id: String::new(),
            new_content: String::new(),
        })?;
        let access = self.require_access()?;
        self.check_can_modify(access, message_id)?;
        let new_content = prepare_send(access, new_content)?;
        let message = self
            .backend
            .edit_message(self.timeline.conversation_id(), message_id, &new_content)
            .await?;
        Ok(message.id)
    }

    async fn handle_delete(&mut self, client_txn_id: String, message_id: String) {
        let outcome = self.delete_message(&message_id).await;
        self.emit(normalize_send_outcome(client_txn_id, outcome.into()));
    }

    async fn delete_message(&mut self, message_id: &str) -> Result<String, ChatError> {
        self.validate_transition(&ConversationCommand::Delete {
            client_txn_id: String::new(),
            message_id: String::new(),
        })?;
        let access = self.require_access()?;
        self.check_can_modify(access, message_id)?;
        let message = self
            .backend
            .mark_deleted(self.timeline.conversation_id(), message_id)
            .await?;
        Ok(message.id)
    }

    fn check_can_modify(&self, access: AccessMode, message_id: &str) -> Result<(), ChatError> {
        let message = self
            .timeline
            .get(message_id)
            .ok_or_else(|| ChatError::message_not_found(message_id))?;
        ensure_can_modify(&self.session, access, message)
    }

    fn handle_close(&mut self) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(&ConversationCommand::Close)?;
        self.teardown();
        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    fn teardown(&mut self) {
        self.timeline.dispose();
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.resubscribe_at = None;
    }

    fn attach_feed(&mut self) {
        if self.timeline.is_disposed() {
            return;
        }
        let conversation_id = self.timeline.conversation_id().clone();
        let since_ms = self.timeline.oldest_loaded_timestamp();
        match self.backend.subscribe(&conversation_id, since_ms) {
            Ok(subscription) => {
                debug!(%conversation_id, ?since_ms, "live feed subscribed");
                self.resubscribe_attempt = 0;
                self.subscription = Some(subscription);
            }
            Err(err) => self.on_feed_failure(err),
        }
    }

    fn handle_feed_item(&mut self, item: Option<FeedItem>) {
        match item {
            Some(Ok(events)) => {
                let Some(merge) = self.timeline.apply_live_batch(events) else {
                    return;
                };
                if merge.applied > 0 {
                    self.emit_timeline(UpdateCause::LiveBatch, merge.should_auto_scroll, None);
                }
            }
            Some(Err(err)) => {
                self.subscription = None;
                self.on_feed_failure(err);
            }
            None => {
                self.subscription = None;
                self.on_feed_failure(ChatError::subscription_failed("live feed closed"));
            }
        }
    }

    /// Report a feed failure and schedule a re-subscription. The timeline
    /// keeps its last known state meanwhile.
    fn on_feed_failure(&mut self, err: ChatError) {
        if self.timeline.is_disposed() {
            return;
        }
        let delay = self
            .config
            .retry_policy
            .delay_for_attempt(self.resubscribe_attempt, err.retry_after_ms);
        self.resubscribe_attempt = self.resubscribe_attempt.saturating_add(1);

        match delay {
            Some(delay) => {
                warn!(
                    code = %err.code,
                    attempt = self.resubscribe_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "live feed failed; re-subscribing"
                );
                self.resubscribe_at = Some(Instant::now() + delay);
                self.emit(normalize_error(err.with_retry_after(delay)));
            }
            None => {
                warn!(code = %err.code, "live feed failed; retry budget spent");
                self.emit(ConversationEvent::Error {
                    code: err.code,
                    message: err.message,
                    recoverable: false,
                    retry_after_ms: None,
                });
            }
        }
    }

    fn emit_timeline(
        &self,
        cause: UpdateCause,
        should_auto_scroll: bool,
        scroll_anchor_index: Option<usize>,
    ) {
        self.emit(ConversationEvent::TimelineUpdated(TimelineUpdate {
            conversation_id: self.timeline.conversation_id().clone(),
            cause,
            sequence: self.timeline.sequence().to_vec(),
            should_auto_scroll,
            scroll_anchor_index,
            all_older_loaded: self.timeline.all_older_loaded(),
        }));
    }

    /// Best-effort fan-out; with no subscribers the event is dropped.
    fn emit(&self, event: ConversationEvent) {
        self.endpoint.publish(event);
    }

    fn require_access(&self) -> Result<AccessMode, ChatError> {
        self.access.ok_or_else(|| {
            ChatError::invalid_state(self.state_machine.state(), "write before access resolved")
        })
    }

    fn validate_transition(
        &self,
        command: &ConversationCommand,
    ) -> Result<(ConversationStateMachine, Vec<ConversationEvent>), ChatError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(
        &mut self,
        candidate: ConversationStateMachine,
        events: Vec<ConversationEvent>,
    ) {
        self.state_machine = candidate;
        for event in events {
            self.emit(event);
        }
    }
}

async fn next_feed_item(subscription: &mut Option<Subscription>) -> Option<FeedItem> {
    match subscription {
        Some(subscription) => subscription.next_batch().await,
        None => future::pending().await,
    }
}

async fn resubscribe_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::{ConversationInfo, MessageWriter, ReadOnlyReason, TaskStatus};
    use chat_platform::InMemoryChatBackend;
    use tokio::time::timeout;

    use super::*;

    fn conversation() -> ConversationId {
        ConversationId::task("g1", "t1")
    }

    fn backend(task_status: Option<TaskStatus>, history: usize) -> Arc<InMemoryChatBackend> {
        seeded(InMemoryChatBackend::new(), task_status, history)
    }

    fn seeded(
        backend: InMemoryChatBackend,
        task_status: Option<TaskStatus>,
        history: usize,
    ) -> Arc<InMemoryChatBackend> {
        let backend = backend.with_clock(|| 1_000_000);
        backend
            .add_conversation(ConversationInfo {
                id: conversation(),
                title: "Ship release".to_owned(),
                members: vec!["alice".to_owned(), "bob".to_owned()],
                task_status,
            })
            .expect("register conversation");
        backend
            .seed_sequential(&conversation(), "bob", history)
            .expect("seed history");
        Arc::new(backend)
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            retry_policy: RetryPolicy::new(10, 40),
            ..RuntimeConfig::default()
        }
    }

    async fn wait_for<F>(events: &mut EventStream, mut predicate: F) -> ConversationEvent
    where
        F: FnMut(&ConversationEvent) -> bool,
    {
        timeout(Duration::from_secs(3), async {
            loop {
                let event = events.recv().await.expect("event receive");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event timeout")
    }

    async fn wait_for_timeline<F>(events: &mut EventStream, mut predicate: F) -> TimelineUpdate
    where
        F: FnMut(&TimelineUpdate) -> bool,
    {
        let event = wait_for(events, |event| {
            matches!(event, ConversationEvent::TimelineUpdated(update) if predicate(update))
        })
        .await;
        match event {
            ConversationEvent::TimelineUpdated(update) => update,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    async fn open(handle: &ConversationHandle, events: &mut EventStream) {
        handle
            .send(ConversationCommand::Open)
            .await
            .expect("command should enqueue");
        wait_for(events, |event| {
            *event
                == ConversationEvent::StateChanged {
                    state: ConversationLifecycleState::Live,
                }
        })
        .await;
    }

    fn timestamps(update: &TimelineUpdate) -> Vec<i64> {
        update.sequence.iter().map(|m| m.timestamp_ms).collect()
    }

    #[tokio::test]
    async fn open_emits_lifecycle_access_and_initial_page() {
        let backend = backend(Some(TaskStatus::InProgress), 120);
        let handle = spawn_conversation(backend, Session::new("alice"), conversation(), fast_config());
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::Open)
            .await
            .expect("command should enqueue");

        let first = wait_for(&mut events, |_| true).await;
        assert_eq!(
            first,
            ConversationEvent::StateChanged {
                state: ConversationLifecycleState::Opening
            }
        );
        let access = wait_for(&mut events, |_| true).await;
        assert_eq!(
            access,
            ConversationEvent::AccessResolved {
                access: AccessMode::ReadWrite
            }
        );
        let update = wait_for_timeline(&mut events, |_| true).await;
        assert_eq!(update.cause, UpdateCause::InitialPage);
        assert_eq!(timestamps(&update), (71..=120_i64).collect::<Vec<_>>());
        assert!(!update.all_older_loaded);
        let live = wait_for(&mut events, |_| true).await;
        assert_eq!(
            live,
            ConversationEvent::StateChanged {
                state: ConversationLifecycleState::Live
            }
        );
    }

    #[tokio::test]
    async fn commands_before_open_are_rejected() {
        let backend = backend(Some(TaskStatus::InProgress), 5);
        let handle = spawn_conversation(backend, Session::new("alice"), conversation(), fast_config());
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::LoadOlder)
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |_| true).await {
            ConversationEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "invalid_state_transition");
                assert!(!recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle
            .send(ConversationCommand::Send {
                client_txn_id: "tx-early".to_owned(),
                content: "hi".to_owned(),
            })
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |_| true).await {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "tx-early");
                assert_eq!(ack.error_code.as_deref(), Some("invalid_state_transition"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scrolling_near_top_pages_backward_with_anchor() {
        let backend = backend(Some(TaskStatus::InProgress), 120);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        handle
            .send(ConversationCommand::UpdateViewport {
                first_visible: 2,
                last_visible: 12,
            })
            .await
            .expect("command should enqueue");
        let update =
            wait_for_timeline(&mut events, |update| update.cause == UpdateCause::OlderPage).await;
        assert_eq!(timestamps(&update), (21..=120_i64).collect::<Vec<_>>());
        assert_eq!(update.scroll_anchor_index, Some(50));
        assert!(!update.all_older_loaded);

        handle
            .send(ConversationCommand::LoadOlder)
            .await
            .expect("command should enqueue");
        let update =
            wait_for_timeline(&mut events, |update| update.cause == UpdateCause::OlderPage).await;
        assert_eq!(update.sequence.len(), 120);
        assert_eq!(update.scroll_anchor_index, Some(20));
        assert!(update.all_older_loaded);
    }

    #[tokio::test]
    async fn live_messages_merge_while_older_page_is_in_flight() {
        let backend = seeded(
            InMemoryChatBackend::new().with_fetch_delay(Duration::from_millis(300)),
            Some(TaskStatus::InProgress),
            120,
        );
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        handle
            .send(ConversationCommand::UpdateViewport {
                first_visible: 2,
                last_visible: 12,
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ConversationCommand::Send {
                client_txn_id: "tx-paging".to_owned(),
                content: "while paging".to_owned(),
            })
            .await
            .expect("command should enqueue");

        let ack = wait_for(&mut events, |event| matches!(event, ConversationEvent::SendAck(_))).await;
        let message_id = match ack {
            ConversationEvent::SendAck(ack) => ack.message_id.expect("message id on success"),
            other => panic!("unexpected event: {other:?}"),
        };
        let live = wait_for_timeline(&mut events, |update| {
            update.sequence.iter().any(|m| m.id == message_id)
        })
        .await;
        assert_eq!(live.cause, UpdateCause::LiveBatch);
        assert_eq!(live.sequence.len(), 51);

        let older =
            wait_for_timeline(&mut events, |update| update.cause == UpdateCause::OlderPage).await;
        assert_eq!(older.sequence.len(), 101);
        assert_eq!(older.scroll_anchor_index, Some(50));
        assert_eq!(older.sequence[50].timestamp_ms, 71);
        let newest = older.sequence.last().expect("sent message is newest");
        assert_eq!(newest.id, message_id);
        assert!(
            older
                .sequence
                .windows(2)
                .all(|pair| pair[0].order_key() < pair[1].order_key())
        );
    }

    #[tokio::test]
    async fn viewport_far_from_top_does_not_page() {
        let backend = backend(Some(TaskStatus::InProgress), 120);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;
        let calls_after_open = backend.fetch_calls();

        handle
            .send(ConversationCommand::UpdateViewport {
                first_visible: 30,
                last_visible: 49,
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ConversationCommand::Close)
            .await
            .expect("command should enqueue");
        wait_for(&mut events, |event| {
            matches!(
                event,
                ConversationEvent::StateChanged {
                    state: ConversationLifecycleState::Disposed
                }
            )
        })
        .await;
        assert_eq!(backend.fetch_calls(), calls_after_open);
    }

    #[tokio::test]
    async fn send_flows_back_through_live_feed_with_auto_scroll() {
        let backend = backend(Some(TaskStatus::InProgress), 10);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        handle
            .send(ConversationCommand::UpdateViewport {
                first_visible: 0,
                last_visible: 9,
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ConversationCommand::Send {
                client_txn_id: "tx-1".to_owned(),
                content: "  on it  ".to_owned(),
            })
            .await
            .expect("command should enqueue");

        let ack = wait_for(&mut events, |event| matches!(event, ConversationEvent::SendAck(_))).await;
        let message_id = match ack {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "tx-1");
                assert_eq!(ack.error_code, None);
                ack.message_id.expect("message id on success")
            }
            other => panic!("unexpected event: {other:?}"),
        };

        let update = wait_for_timeline(&mut events, |update| {
            update.sequence.iter().any(|m| m.id == message_id)
        })
        .await;
        assert_eq!(update.cause, UpdateCause::LiveBatch);
        assert!(update.should_auto_scroll);
        let last = update.sequence.last().expect("sent message is newest");
        assert_eq!(last.id, message_id);
        assert_eq!(last.content, "on it");
        assert_eq!(last.sender_id, "alice");
    }

    #[tokio::test]
    async fn edit_and_delete_require_ownership() {
        let backend = backend(Some(TaskStatus::InProgress), 3);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        handle
            .send(ConversationCommand::Edit {
                client_txn_id: "tx-edit".to_owned(),
                message_id: "m0001".to_owned(),
                new_content: "not mine".to_owned(),
            })
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::SendAck(_))).await {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("not_message_owner"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle
            .send(ConversationCommand::Delete {
                client_txn_id: "tx-del".to_owned(),
                message_id: "missing".to_owned(),
            })
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::SendAck(_))).await {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("message_not_found"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn own_message_edit_and_tombstone_update_in_place() {
        let backend = backend(Some(TaskStatus::InProgress), 3);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("bob"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        handle
            .send(ConversationCommand::Edit {
                client_txn_id: "tx-edit".to_owned(),
                message_id: "m0002".to_owned(),
                new_content: "fixed typo".to_owned(),
            })
            .await
            .expect("command should enqueue");
        let update = wait_for_timeline(&mut events, |update| {
            update.sequence.iter().any(|m| m.content == "fixed typo")
        })
        .await;
        assert_eq!(update.sequence.len(), 3);
        assert_eq!(update.sequence[1].id, "m0002");

        handle
            .send(ConversationCommand::Delete {
                client_txn_id: "tx-del".to_owned(),
                message_id: "m0002".to_owned(),
            })
            .await
            .expect("command should enqueue");
        let update = wait_for_timeline(&mut events, |update| {
            update.sequence.iter().any(|m| m.is_deleted)
        })
        .await;
        assert_eq!(update.sequence.len(), 3);
        assert!(update.sequence[1].is_deleted);
    }

    #[tokio::test]
    async fn completed_task_is_read_only() {
        let backend = backend(Some(TaskStatus::Completed), 3);
        let handle = spawn_conversation(backend, Session::new("alice"), conversation(), fast_config());
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::Open)
            .await
            .expect("command should enqueue");
        let access = wait_for(&mut events, |event| {
            matches!(event, ConversationEvent::AccessResolved { .. })
        })
        .await;
        assert_eq!(
            access,
            ConversationEvent::AccessResolved {
                access: AccessMode::ReadOnly(ReadOnlyReason::TaskCompleted)
            }
        );

        handle
            .send(ConversationCommand::Send {
                client_txn_id: "tx-ro".to_owned(),
                content: "late".to_owned(),
            })
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::SendAck(_))).await {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("read_only_conversation"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_member_open_fails_back_to_cold() {
        let backend = backend(Some(TaskStatus::InProgress), 3);
        let handle = spawn_conversation(backend, Session::new("mallory"), conversation(), fast_config());
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::Open)
            .await
            .expect("command should enqueue");
        wait_for(&mut events, |event| {
            *event
                == ConversationEvent::StateChanged {
                    state: ConversationLifecycleState::Cold,
                }
        })
        .await;
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::Error { .. })).await {
            ConversationEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "not_a_member");
                assert!(!recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_initial_fetch_can_be_retried() {
        let backend = backend(Some(TaskStatus::InProgress), 5);
        backend
            .fail_next_fetch(ChatError::fetch_failed("offline"))
            .expect("inject");
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::Open)
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::Error { .. })).await {
            ConversationEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "fetch_failed");
                assert!(recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        open(&handle, &mut events).await;
        assert_eq!(backend.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn failed_older_page_reports_retry_hint_and_allows_retry() {
        let backend = backend(Some(TaskStatus::InProgress), 120);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        backend
            .fail_next_fetch(ChatError::fetch_failed("flaky"))
            .expect("inject");
        handle
            .send(ConversationCommand::LoadOlder)
            .await
            .expect("command should enqueue");
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::Error { .. })).await {
            ConversationEvent::Error {
                code,
                recoverable,
                retry_after_ms,
                ..
            } => {
                assert_eq!(code, "fetch_failed");
                assert!(recoverable);
                assert_eq!(retry_after_ms, Some(10));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle
            .send(ConversationCommand::LoadOlder)
            .await
            .expect("command should enqueue");
        let update =
            wait_for_timeline(&mut events, |update| update.cause == UpdateCause::OlderPage).await;
        assert_eq!(timestamps(&update), (21..=120_i64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn broken_feed_is_resubscribed_and_catches_up() {
        let backend = backend(Some(TaskStatus::InProgress), 5);
        let handle = spawn_conversation(
            Arc::clone(&backend),
            Session::new("alice"),
            conversation(),
            fast_config(),
        );
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;
        wait_for_timeline(&mut events, |update| update.cause == UpdateCause::LiveBatch).await;
        assert_eq!(backend.subscribe_calls(), 1);

        backend.break_feed(&conversation(), ChatError::subscription_failed("reset"));
        match wait_for(&mut events, |event| matches!(event, ConversationEvent::Error { .. })).await {
            ConversationEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "subscription_failed");
                assert!(recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let sent = backend
            .send_message(&conversation(), "bob", "while you were away")
            .await
            .expect("send");
        let update = wait_for_timeline(&mut events, |update| {
            update.sequence.iter().any(|m| m.id == sent.id)
        })
        .await;
        assert_eq!(update.sequence.len(), 6);
        assert!(backend.subscribe_calls() >= 2);
    }

    #[tokio::test]
    async fn close_disposes_and_stops_runtime() {
        let backend = backend(Some(TaskStatus::InProgress), 5);
        let handle = spawn_conversation(backend, Session::new("alice"), conversation(), fast_config());
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;

        handle
            .send(ConversationCommand::Close)
            .await
            .expect("command should enqueue");
        wait_for(&mut events, |event| {
            *event
                == ConversationEvent::StateChanged {
                    state: ConversationLifecycleState::Disposed,
                }
        })
        .await;

        let err = timeout(Duration::from_secs(2), async {
            loop {
                if let Err(err) = handle.send(ConversationCommand::LoadOlder).await {
                    return err;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("runtime should stop");
        assert!(matches!(err, ConversationChannelError::RuntimeStopped));
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_runtime() {
        let backend = backend(Some(TaskStatus::InProgress), 5);
        let handle = spawn_conversation(backend, Session::new("alice"), conversation(), fast_config());
        let mut events = handle.subscribe();
        open(&handle, &mut events).await;
        drop(handle);

        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    _ => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "event stream should close once the runtime exits");
    }

    #[tokio::test]
    async fn empty_conversation_opens_exhausted() {
        let backend = backend(None, 0);
        let handle = spawn_conversation(backend, Session::new("alice"), conversation(), fast_config());
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::Open)
            .await
            .expect("command should enqueue");
        let update =
            wait_for_timeline(&mut events, |update| update.cause == UpdateCause::InitialPage).await;
        assert!(update.sequence.is_empty());
        assert!(update.all_older_loaded);
    }

    #[test]
    fn default_config_uses_standard_page_size() {
        let config = RuntimeConfig::default();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.command_buffer, 64);
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.retry_policy, RetryPolicy::default());
    }
}
