use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::{
    error::{ChatError, ErrorCategory},
    store::{MessageStore, PageQuery},
    types::{ConversationId, Message, MessageEvent},
    viewport::{ScrollPolicy, Viewport},
};

/// Messages requested per page, both for the initial load and backward pages.
pub const PAGE_SIZE: usize = 50;

/// Outcome of applying a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    /// Ordered, de-duplicated sequence after the merge.
    pub sequence: Vec<Message>,
    /// Messages the store returned.
    pub fetched: usize,
    /// Messages that were not already retained.
    pub inserted: usize,
    /// Index of the message that was first when the page was requested, so
    /// the viewport can stay put while history is prepended.
    pub scroll_anchor_index: Option<usize>,
    pub all_older_loaded: bool,
}

/// Outcome of applying a live batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub sequence: Vec<Message>,
    /// The viewer was near the bottom before the merge.
    pub should_auto_scroll: bool,
    /// Events that were applied (foreign-conversation events are skipped).
    pub applied: usize,
}

/// Why a backward page request did not go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another backward fetch is still running.
    InFlight,
    /// The previous page came back short; history is exhausted.
    Exhausted,
    /// No cursor yet: the initial page is missing or was empty.
    NoCursor,
    /// The timeline was disposed.
    Disposed,
}

/// Result of a `load_older_page` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OlderPage {
    Loaded(PageResult),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitialLoad {
    NotRequested,
    InFlight,
    Loaded,
}

/// Merges a live upsert stream with backward pagination into one ordered,
/// de-duplicated message sequence for a single conversation.
///
/// The sequence is sorted by `(timestamp_ms, id)` and rebuilt from the
/// retained set after every mutation. Tombstones are retained like any other
/// message. Fetches are split into `begin_*`/`complete_*` halves so an owner
/// can run them concurrently with live batches; the `load_*` helpers chain
/// both halves against a [`MessageStore`].
#[derive(Debug, Clone)]
pub struct TimelineReducer {
    conversation_id: ConversationId,
    page_size: usize,
    scroll_policy: ScrollPolicy,
    retained: HashMap<String, Message>,
    sequence: Vec<Message>,
    oldest_loaded_ms: Option<i64>,
    all_older_loaded: bool,
    loading_older: bool,
    /// First message when the outstanding backward fetch was requested.
    older_anchor: Option<String>,
    initial: InitialLoad,
    viewport: Option<Viewport>,
    disposed: bool,
}

impl TimelineReducer {
    /// Create an empty reducer using [`PAGE_SIZE`].
    pub fn new(conversation_id: ConversationId) -> Self {
        Self::with_page_size(conversation_id, PAGE_SIZE)
    }

    /// Create an empty reducer with a custom page size (`page_size >= 1`).
    pub fn with_page_size(conversation_id: ConversationId, page_size: usize) -> Self {
        Self {
            conversation_id,
            page_size: page_size.max(1),
            scroll_policy: ScrollPolicy::default(),
            retained: HashMap::new(),
            sequence: Vec::new(),
            oldest_loaded_ms: None,
            all_older_loaded: false,
            loading_older: false,
            older_anchor: None,
            initial: InitialLoad::NotRequested,
            viewport: None,
            disposed: false,
        }
    }

    pub fn with_scroll_policy(mut self, scroll_policy: ScrollPolicy) -> Self {
        self.scroll_policy = scroll_policy;
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn scroll_policy(&self) -> ScrollPolicy {
        self.scroll_policy
    }

    /// Current messages in display order.
    pub fn sequence(&self) -> &[Message] {
        &self.sequence
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.retained.get(message_id)
    }

    /// Exclusive cursor for the next backward page.
    pub fn oldest_loaded_timestamp(&self) -> Option<i64> {
        self.oldest_loaded_ms
    }

    pub fn all_older_loaded(&self) -> bool {
        self.all_older_loaded
    }

    pub fn is_loading_older(&self) -> bool {
        self.loading_older
    }

    pub fn initial_page_loaded(&self) -> bool {
        self.initial == InitialLoad::Loaded
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Record the rendered visible range; consulted by the next live merge.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    /// Whether the viewport is close enough to the top to page backward.
    pub fn wants_older_page(&self) -> bool {
        match self.viewport {
            Some(viewport) => {
                self.scroll_policy.should_load_older(viewport)
                    && self.begin_older_page_check().is_ok()
            }
            None => false,
        }
    }

    /// Mark the reducer inactive. Later batches and fetch completions are
    /// discarded without touching state.
    pub fn dispose(&mut self) {
        if !self.disposed {
            debug!(conversation_id = %self.conversation_id, "timeline disposed");
        }
        self.disposed = true;
        self.loading_older = false;
        self.older_anchor = None;
    }

    /// Start the initial load. Only valid once, on a fresh reducer.
    pub fn begin_initial_page(&mut self) -> Result<PageQuery, ChatError> {
        if self.disposed {
            return Err(disposed_error("begin_initial_page"));
        }
        if self.initial != InitialLoad::NotRequested || !self.retained.is_empty() {
            return Err(ChatError::new(
                ErrorCategory::InvalidState,
                "initial_page_already_loaded",
                format!(
                    "initial page for {} was already requested",
                    self.conversation_id
                ),
            ));
        }
        self.initial = InitialLoad::InFlight;
        Ok(PageQuery::newest(self.conversation_id.clone(), self.page_size))
    }

    /// Apply the initial page fetch result.
    ///
    /// Returns `Ok(None)` when the reducer was disposed meanwhile. On failure
    /// the reducer returns to its fresh state so the load can be retried.
    pub fn complete_initial_page(
        &mut self,
        fetched: Result<Vec<Message>, ChatError>,
    ) -> Result<Option<PageResult>, ChatError> {
        if self.disposed {
            trace!(conversation_id = %self.conversation_id, "dropping initial page after dispose");
            return Ok(None);
        }
        if self.initial != InitialLoad::InFlight {
            warn!(conversation_id = %self.conversation_id, "ignoring unexpected initial page completion");
            return Ok(None);
        }

        let messages = match fetched {
            Ok(messages) => messages,
            Err(err) => {
                warn!(conversation_id = %self.conversation_id, error = %err, "initial page fetch failed");
                self.initial = InitialLoad::NotRequested;
                return Err(err);
            }
        };

        let fetched = messages.len();
        let mut inserted = 0;
        for message in messages.into_iter().rev() {
            if !self.accepts(&message) {
                continue;
            }
            self.oldest_loaded_ms = Some(
                self.oldest_loaded_ms
                    .map_or(message.timestamp_ms, |oldest| oldest.min(message.timestamp_ms)),
            );
            if self.retained.insert(message.id.clone(), message).is_none() {
                inserted += 1;
            }
        }
        self.all_older_loaded = fetched < self.page_size;
        self.initial = InitialLoad::Loaded;
        self.rebuild_sequence();

        debug!(
            conversation_id = %self.conversation_id,
            fetched,
            oldest_loaded_ms = ?self.oldest_loaded_ms,
            all_older_loaded = self.all_older_loaded,
            "initial page applied"
        );

        Ok(Some(PageResult {
            sequence: self.sequence.clone(),
            fetched,
            inserted,
            scroll_anchor_index: None,
            all_older_loaded: self.all_older_loaded,
        }))
    }

    /// Fetch and apply the newest page from `store`.
    pub async fn load_initial_page<S: MessageStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<PageResult, ChatError> {
        let query = self.begin_initial_page()?;
        let fetched = store.fetch_page(&query).await;
        self.complete_initial_page(fetched)?
            .ok_or_else(|| disposed_error("load_initial_page"))
    }

    /// Upsert a batch of live events by message ID.
    ///
    /// Returns `None` once disposed. Events for other conversations are
    /// skipped.
    pub fn apply_live_batch(&mut self, events: Vec<MessageEvent>) -> Option<MergeResult> {
        if self.disposed {
            trace!(
                conversation_id = %self.conversation_id,
                event_count = events.len(),
                "dropping live batch after dispose"
            );
            return None;
        }

        let should_auto_scroll = self
            .scroll_policy
            .is_near_bottom(self.viewport, self.sequence.len());

        let mut applied = 0;
        for event in events {
            trace!(
                conversation_id = %self.conversation_id,
                message_id = %event.message().id,
                kind = event.kind(),
                "applying live event"
            );
            let message = event.into_message();
            if !self.accepts(&message) {
                continue;
            }
            self.retained.insert(message.id.clone(), message);
            applied += 1;
        }
        if applied > 0 {
            self.rebuild_sequence();
        }

        Some(MergeResult {
            sequence: self.sequence.clone(),
            should_auto_scroll,
            applied,
        })
    }

    /// Start a backward page fetch, or report why none is needed.
    pub fn begin_older_page(&mut self) -> Result<PageQuery, SkipReason> {
        let before = self.begin_older_page_check()?;
        self.loading_older = true;
        self.older_anchor = self.sequence.first().map(|message| message.id.clone());
        Ok(PageQuery::older_than(
            self.conversation_id.clone(),
            before,
            self.page_size,
        ))
    }

    /// Apply a backward page fetch result.
    ///
    /// Existing copies of a message always win over the fetched copy. The
    /// in-flight guard is cleared on every path. Returns `Ok(None)` when
    /// disposed or when no backward fetch was outstanding.
    pub fn complete_older_page(
        &mut self,
        fetched: Result<Vec<Message>, ChatError>,
    ) -> Result<Option<PageResult>, ChatError> {
        if self.disposed {
            trace!(conversation_id = %self.conversation_id, "dropping older page after dispose");
            return Ok(None);
        }
        if !self.loading_older {
            warn!(conversation_id = %self.conversation_id, "ignoring unexpected older page completion");
            return Ok(None);
        }
        self.loading_older = false;
        let requested_anchor = self.older_anchor.take();

        let messages = match fetched {
            Ok(messages) => messages,
            Err(err) => {
                warn!(conversation_id = %self.conversation_id, error = %err, "older page fetch failed");
                return Err(err);
            }
        };

        let top_id = self.sequence.first().map(|message| message.id.clone());
        let fetched = messages.len();
        let mut inserted = 0;
        for message in messages.into_iter().rev() {
            if !self.accepts(&message) {
                continue;
            }
            self.oldest_loaded_ms = Some(
                self.oldest_loaded_ms
                    .map_or(message.timestamp_ms, |oldest| oldest.min(message.timestamp_ms)),
            );
            if !self.retained.contains_key(&message.id) {
                self.retained.insert(message.id.clone(), message);
                inserted += 1;
            }
        }
        if fetched < self.page_size {
            self.all_older_loaded = true;
        }
        if inserted > 0 {
            self.rebuild_sequence();
        }

        let scroll_anchor_index = requested_anchor
            .or_else(|| top_id.clone())
            .and_then(|anchor_id| self.position_of(&anchor_id));
        // Rows were prepended above the current top; keep the stored viewport
        // on the same messages.
        if let Some(rows) = top_id
            .and_then(|top_id| self.position_of(&top_id))
            .filter(|rows| *rows > 0)
            && let Some(viewport) = self.viewport
        {
            self.viewport = Some(viewport.shifted_down(rows));
        }

        debug!(
            conversation_id = %self.conversation_id,
            fetched,
            inserted,
            oldest_loaded_ms = ?self.oldest_loaded_ms,
            all_older_loaded = self.all_older_loaded,
            "older page applied"
        );

        Ok(Some(PageResult {
            sequence: self.sequence.clone(),
            fetched,
            inserted,
            scroll_anchor_index,
            all_older_loaded: self.all_older_loaded,
        }))
    }

    /// Fetch and apply the next backward page from `store`.
    pub async fn load_older_page<S: MessageStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<OlderPage, ChatError> {
        let query = match self.begin_older_page() {
            Ok(query) => query,
            Err(reason) => {
                trace!(conversation_id = %self.conversation_id, ?reason, "older page skipped");
                return Ok(OlderPage::Skipped(reason));
            }
        };
        let fetched = store.fetch_page(&query).await;
        Ok(match self.complete_older_page(fetched)? {
            Some(result) => OlderPage::Loaded(result),
            None => OlderPage::Skipped(SkipReason::Disposed),
        })
    }

    fn begin_older_page_check(&self) -> Result<i64, SkipReason> {
        if self.disposed {
            return Err(SkipReason::Disposed);
        }
        if self.loading_older {
            return Err(SkipReason::InFlight);
        }
        if self.all_older_loaded {
            return Err(SkipReason::Exhausted);
        }
        self.oldest_loaded_ms.ok_or(SkipReason::NoCursor)
    }

    fn position_of(&self, message_id: &str) -> Option<usize> {
        self.sequence
            .iter()
            .position(|message| message.id == message_id)
    }

    fn accepts(&self, message: &Message) -> bool {
        if message.conversation_id == self.conversation_id {
            return true;
        }
        warn!(
            conversation_id = %self.conversation_id,
            foreign_conversation_id = %message.conversation_id,
            message_id = %message.id,
            "skipping message from another conversation"
        );
        false
    }

    fn rebuild_sequence(&mut self) {
        let mut sequence: Vec<Message> = self.retained.values().cloned().collect();
        sequence.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        self.sequence = sequence;
    }
}

fn disposed_error(action: &str) -> ChatError {
    ChatError::new(
        ErrorCategory::InvalidState,
        "timeline_disposed",
        format!("cannot run '{action}' on a disposed timeline"),
    )
}
