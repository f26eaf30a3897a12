use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use sync_core::schema::tables;
use sync_core::ChatMessage;
use sync_feed::{
    ChangeEvent, ChangeFeed, ChangeHandler, ChannelSpec, EventType, RetryConfig, Row, RowFilter,
    Subscription, SubscriptionConfig, SubscriptionState,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::ports::{CacheInvalidator, CacheKey, Refetch, SyncDeps, SyncError};

/// Locally generated id of a message that has not been confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    pub fn new() -> Self {
        TempId(Uuid::new_v4())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub request_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl MessageDraft {
    pub fn new(request_id: Uuid, sender_id: Uuid, body: impl Into<String>) -> Self {
        Self {
            request_id,
            sender_id,
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEntry {
    Confirmed(ChatMessage),
    Optimistic { temp_id: TempId, draft: MessageDraft },
}

impl ChatEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ChatEntry::Confirmed(message) => message.created_at,
            ChatEntry::Optimistic { draft, .. } => draft.created_at,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            ChatEntry::Confirmed(message) => &message.body,
            ChatEntry::Optimistic { draft, .. } => &draft.body,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self, ChatEntry::Optimistic { .. })
    }

    fn sort_id(&self) -> String {
        match self {
            ChatEntry::Confirmed(message) => message.id.to_string(),
            ChatEntry::Optimistic { temp_id, .. } => temp_id.to_string(),
        }
    }
}

/// The visible message list of one conversation.
///
/// Echoes of the current user's own inserts that arrive while any of their
/// optimistic entries are in flight are held back until the sender claims
/// them through [`MessageList::replace_optimistic`]. Whatever is still held
/// once no optimistic entry remains is shown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageList {
    entries: Vec<ChatEntry>,
    held: HashMap<Uuid, ChatMessage>,
}

impl MessageList {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        let mut list = Self {
            entries: messages.into_iter().map(ChatEntry::Confirmed).collect(),
            held: HashMap::new(),
        };
        list.sort();
        list
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn has_optimistic(&self) -> bool {
        self.entries.iter().any(ChatEntry::is_optimistic)
    }

    /// Read state of a confirmed or held message, if the list knows it.
    pub fn is_read(&self, id: Uuid) -> Option<bool> {
        self.get(id)
            .or_else(|| self.held.get(&id))
            .map(|message| message.is_read)
    }

    pub fn get(&self, id: Uuid) -> Option<&ChatMessage> {
        self.entries.iter().find_map(|entry| match entry {
            ChatEntry::Confirmed(message) if message.id == id => Some(message),
            _ => None,
        })
    }

    /// Applies one remote change. Rows that do not decode leave the list unchanged.
    pub fn reconcile(mut self, change: &ChangeEvent, me: Uuid) -> Self {
        match change.event_type {
            EventType::Insert => {
                let Ok(Some(message)) = change.new_record::<ChatMessage>() else {
                    return self;
                };
                let claimable = message.sender_id == me
                    && self.has_optimistic()
                    && self.get(message.id).is_none();
                if claimable {
                    self.held.insert(message.id, message);
                } else {
                    self.upsert(message);
                }
            }
            EventType::Update => {
                let Ok(Some(message)) = change.new_record::<ChatMessage>() else {
                    return self;
                };
                if let Some(held) = self.held.get_mut(&message.id) {
                    *held = message;
                } else {
                    self.upsert(message);
                }
            }
            EventType::Delete => {
                let Some(id) = change.before.as_ref().and_then(row_id) else {
                    return self;
                };
                self.held.remove(&id);
                self.entries
                    .retain(|entry| !matches!(entry, ChatEntry::Confirmed(m) if m.id == id));
            }
        }
        self.sort();
        self
    }

    pub fn add_optimistic(mut self, temp_id: TempId, draft: MessageDraft) -> Self {
        self.entries.push(ChatEntry::Optimistic { temp_id, draft });
        self.sort();
        self
    }

    pub fn replace_optimistic(mut self, temp_id: TempId, real: ChatMessage) -> Self {
        self.drop_optimistic(temp_id);
        self.held.remove(&real.id);
        self.upsert(real);
        self.release_held();
        self.sort();
        self
    }

    pub fn remove_optimistic(mut self, temp_id: TempId) -> Self {
        self.drop_optimistic(temp_id);
        self.release_held();
        self.sort();
        self
    }

    fn drop_optimistic(&mut self, temp_id: TempId) {
        self.entries
            .retain(|entry| !matches!(entry, ChatEntry::Optimistic { temp_id: t, .. } if *t == temp_id));
    }

    fn release_held(&mut self) {
        if self.has_optimistic() {
            return;
        }
        for (_, message) in self.held.drain().collect::<Vec<_>>() {
            self.upsert(message);
        }
    }

    fn upsert(&mut self, message: ChatMessage) {
        let existing = self
            .entries
            .iter_mut()
            .find(|entry| matches!(entry, ChatEntry::Confirmed(m) if m.id == message.id));
        match existing {
            Some(entry) => *entry = ChatEntry::Confirmed(message),
            None => self.entries.push(ChatEntry::Confirmed(message)),
        }
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.sort_id().cmp(&b.sort_id())));
    }
}

fn row_id(row: &Row) -> Option<Uuid> {
    row.get("id")?.as_str()?.parse().ok()
}

pub type MessageCallback = Arc<dyn Fn(&ChatMessage) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ChatCallbacks {
    /// Fires when a message flips from unread to read.
    pub on_read: Option<MessageCallback>,
    /// Fires for every remote update.
    pub on_update: Option<MessageCallback>,
}

struct ChatState {
    request_id: Uuid,
    me: Uuid,
    list: Mutex<MessageList>,
    view: watch::Sender<Vec<ChatEntry>>,
    cache: Arc<dyn CacheInvalidator>,
    callbacks: ChatCallbacks,
}

impl ChatState {
    fn mutate(&self, f: impl FnOnce(MessageList) -> MessageList) {
        let mut list = self.list.lock().unwrap_or_else(|e| e.into_inner());
        let next = f(std::mem::take(&mut *list));
        self.view.send_replace(next.entries().to_vec());
        *list = next;
    }
}

struct ChatHandler(Arc<ChatState>);

impl ChangeHandler for ChatHandler {
    fn on_insert(&self, event: &ChangeEvent) {
        let state = &self.0;
        state.mutate(|list| list.reconcile(event, state.me));

        if let Ok(Some(message)) = event.new_record::<ChatMessage>() {
            if message.sender_id != state.me {
                state
                    .cache
                    .invalidate(CacheKey::Messages(state.request_id), Refetch::Immediate);
            }
        }
    }

    fn on_update(&self, event: &ChangeEvent) {
        let state = &self.0;
        let Ok(Some(message)) = event.new_record::<ChatMessage>() else {
            state.mutate(|list| list.reconcile(event, state.me));
            return;
        };

        // Old images may carry only key columns.
        let mut was_read = event
            .before
            .as_ref()
            .and_then(|row| row.get("is_read"))
            .and_then(|v| v.as_bool());
        state.mutate(|list| {
            if was_read.is_none() {
                was_read = list.is_read(message.id);
            }
            list.reconcile(event, state.me)
        });

        if was_read == Some(false) && message.is_read {
            if let Some(on_read) = &state.callbacks.on_read {
                on_read(&message);
            }
        }
        if let Some(on_update) = &state.callbacks.on_update {
            on_update(&message);
        }
    }

    fn on_delete(&self, event: &ChangeEvent) {
        let state = &self.0;
        state.mutate(|list| list.reconcile(event, state.me));
    }
}

/// Live message list for one request's conversation.
pub struct ChatSync {
    state: Arc<ChatState>,
    subscription: Subscription,
}

impl ChatSync {
    pub fn start(
        feed: Arc<dyn ChangeFeed>,
        deps: &SyncDeps,
        request_id: Uuid,
        initial: Vec<ChatMessage>,
        callbacks: ChatCallbacks,
        retry: RetryConfig,
    ) -> Result<Self, SyncError> {
        let me = deps.require_user()?;
        let list = MessageList::new(initial);
        let (view, _) = watch::channel(list.entries().to_vec());

        let state = Arc::new(ChatState {
            request_id,
            me,
            list: Mutex::new(list),
            view,
            cache: deps.cache.clone(),
            callbacks,
        });

        let channel = ChannelSpec::table(format!("chat:{}", request_id), tables::CHAT_MESSAGES)
            .with_filter(RowFilter::equals("request_id", request_id));
        let subscription = Subscription::create(
            feed,
            SubscriptionConfig::new(channel, Arc::new(ChatHandler(state.clone()))),
            retry,
        );

        Ok(Self { state, subscription })
    }

    pub fn draft(&self, body: impl Into<String>) -> MessageDraft {
        MessageDraft::new(self.state.request_id, self.state.me, body)
    }

    pub fn add_optimistic_message(&self, draft: MessageDraft) -> TempId {
        let temp_id = TempId::new();
        self.state.mutate(|list| list.add_optimistic(temp_id, draft));
        temp_id
    }

    pub fn replace_optimistic_message(&self, temp_id: TempId, real: ChatMessage) {
        self.state.mutate(|list| list.replace_optimistic(temp_id, real));
    }

    /// For sends the store rejected.
    pub fn remove_optimistic_message(&self, temp_id: TempId) {
        self.state.mutate(|list| list.remove_optimistic(temp_id));
    }

    pub fn messages(&self) -> Vec<ChatEntry> {
        self.state.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ChatEntry>> {
        self.state.view.subscribe()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn stop(&self) {
        self.subscription.unsubscribe();
    }
}
