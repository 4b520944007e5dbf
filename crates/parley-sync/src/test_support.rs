//! In-memory backends shared by the engine tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use parley_shared::{
    ChannelError, ContentType, ConversationKey, ConversationKind, DeliveryStatus, PresenceState,
    RemoteKey, TypingStatus, UserId,
};
use parley_store::{Conversation, Database, Message, MessageIdentity};

use crate::channels::{
    MediaUploader, OutgoingMessage, PresenceChannel, RemoteConversationChannel,
    RemoteMessageChannel, SnapshotSink, Subscription,
};
use crate::SharedDatabase;

/// Let spawned tasks run to completion.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn memory_store() -> SharedDatabase {
    crate::share(Database::open_in_memory().unwrap())
}

/// Leave the store's lock poisoned, as if a thread had panicked while
/// holding it.
pub fn poison(store: &SharedDatabase) {
    let store = Arc::clone(store);
    let _ = std::thread::spawn(move || {
        let _guard = store.lock().unwrap();
        panic!("store holder crashed");
    })
    .join();
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_731_000_000, 0).unwrap() + Duration::seconds(secs)
}

/// A confirmed message as the backend would list it.
pub fn remote_message(
    conversation: &str,
    key: &str,
    sender: &str,
    content: &str,
    secs: i64,
) -> Message {
    Message {
        identity: MessageIdentity::Confirmed {
            remote_key: RemoteKey::new(key),
            local_key: None,
        },
        conversation_key: ConversationKey::new(conversation),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        content_type: ContentType::Text,
        media_ref: None,
        timestamp: at(secs),
        delivery_status: DeliveryStatus::Sent,
        read_by: [UserId::new(sender)].into_iter().collect(),
    }
}

/// The backend's confirmation of a pending message.
pub fn confirmed(pending: &Message, key: &str) -> Message {
    let mut message = pending.clone();
    message.identity = MessageIdentity::Confirmed {
        remote_key: RemoteKey::new(key),
        local_key: pending.local_key(),
    };
    message.delivery_status = DeliveryStatus::Sent;
    message
}

pub fn group(key: &str, members: &[&str]) -> Conversation {
    Conversation {
        key: ConversationKey::new(key),
        kind: ConversationKind::Group,
        participant_ids: members.iter().map(|m| UserId::new(*m)).collect(),
        title: Some(key.to_uppercase()),
        avatar_ref: None,
        last_message_preview: None,
        last_message_at: None,
        pending: false,
    }
}

type Sinks<K, T> = Vec<(u64, K, SnapshotSink<T>)>;

fn detach_on_stop<S: Send + 'static>(
    state: &Arc<Mutex<S>>,
    id: u64,
    remove: fn(&mut S, u64),
) -> Subscription {
    let state = Arc::clone(state);
    Subscription::new(move || {
        if let Ok(mut state) = state.lock() {
            remove(&mut *state, id);
        }
    })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MessageBackend {
    sinks: Sinks<ConversationKey, Message>,
    next_sink: u64,
    stopped: usize,
    sent: Vec<OutgoingMessage>,
    read: Vec<(ConversationKey, Vec<RemoteKey>, UserId)>,
    next_key: u64,
    fail_sends: bool,
    hold_sends: bool,
    fail_subscribe: bool,
}

#[derive(Default)]
pub struct MockMessageChannel {
    state: Arc<Mutex<MessageBackend>>,
}

impl MockMessageChannel {
    pub fn push(&self, conversation: &str, messages: Vec<Message>) {
        let sinks: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .sinks
                .iter()
                .filter(|(_, key, _)| key.as_str() == conversation)
                .map(|(_, _, sink)| sink.clone())
                .collect()
        };
        for sink in sinks {
            sink.snapshot(messages.clone());
        }
    }

    pub fn break_stream(&self, error: ChannelError) {
        let sinks: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.sinks.iter().map(|(_, _, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.fail(error.clone());
        }
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn marked_read(&self) -> Vec<(ConversationKey, Vec<RemoteKey>, UserId)> {
        self.state.lock().unwrap().read.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().unwrap().sinks.len()
    }

    pub fn stopped_subscriptions(&self) -> usize {
        self.state.lock().unwrap().stopped
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Sends never complete while set.
    pub fn hold_sends(&self, hold: bool) {
        self.state.lock().unwrap().hold_sends = hold;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().unwrap().fail_subscribe = fail;
    }
}

#[async_trait]
impl RemoteMessageChannel for MockMessageChannel {
    fn subscribe(
        &self,
        conversation: &ConversationKey,
        sink: SnapshotSink<Message>,
    ) -> Result<Subscription, ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(ChannelError::Unavailable);
        }
        state.next_sink += 1;
        let id = state.next_sink;
        state.sinks.push((id, conversation.clone(), sink));
        Ok(detach_on_stop(&self.state, id, |state, id| {
            state.sinks.retain(|(sink_id, _, _)| *sink_id != id);
            state.stopped += 1;
        }))
    }

    async fn send(&self, message: OutgoingMessage) -> Result<Message, ChannelError> {
        let (hold, result) = {
            let mut state = self.state.lock().unwrap();
            state.sent.push(message.clone());
            if state.fail_sends {
                (state.hold_sends, Err(ChannelError::Unavailable))
            } else {
                state.next_key += 1;
                let confirmed = Message {
                    identity: MessageIdentity::Confirmed {
                        remote_key: RemoteKey::new(format!("srv-{}", state.next_key)),
                        local_key: Some(message.local_key),
                    },
                    conversation_key: message.conversation_key,
                    sender_id: message.sender_id.clone(),
                    content: message.content,
                    content_type: message.content_type,
                    media_ref: message.media_ref,
                    timestamp: message.sent_at,
                    delivery_status: DeliveryStatus::Sent,
                    read_by: [message.sender_id].into_iter().collect(),
                };
                (state.hold_sends, Ok(confirmed))
            }
        };
        if hold {
            std::future::pending::<()>().await;
        }
        result
    }

    async fn mark_read(
        &self,
        conversation: &ConversationKey,
        remote_keys: &[RemoteKey],
        reader: &UserId,
    ) -> Result<(), ChannelError> {
        self.state.lock().unwrap().read.push((
            conversation.clone(),
            remote_keys.to_vec(),
            reader.clone(),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ConversationBackend {
    records: BTreeMap<ConversationKey, Conversation>,
    sinks: Sinks<UserId, Conversation>,
    next_sink: u64,
    next_group: u64,
    create_requests: usize,
    fail_creates: bool,
    hold_creates: bool,
}

/// A conversation server. Clones share the same records, so several clients
/// can talk to one backend.
#[derive(Clone, Default)]
pub struct MockConversationChannel {
    state: Arc<Mutex<ConversationBackend>>,
}

impl MockConversationChannel {
    /// Push every subscriber the conversations it participates in.
    pub fn publish(&self) {
        let deliveries: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .sinks
                .iter()
                .map(|(_, user, sink)| {
                    let visible: Vec<Conversation> = state
                        .records
                        .values()
                        .filter(|c| c.has_participant(user))
                        .cloned()
                        .collect();
                    (sink.clone(), visible)
                })
                .collect()
        };
        for (sink, visible) in deliveries {
            sink.snapshot(visible);
        }
    }

    /// Push a raw listing to every subscriber, bypassing the server records.
    pub fn push(&self, conversations: Vec<Conversation>) {
        let sinks: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.sinks.iter().map(|(_, _, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.snapshot(conversations.clone());
        }
    }

    pub fn records(&self) -> Vec<Conversation> {
        self.state.lock().unwrap().records.values().cloned().collect()
    }

    pub fn create_requests(&self) -> usize {
        self.state.lock().unwrap().create_requests
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().unwrap().sinks.len()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_creates = fail;
    }

    pub fn hold_creates(&self, hold: bool) {
        self.state.lock().unwrap().hold_creates = hold;
    }

    fn create(
        &self,
        make: impl FnOnce(&mut ConversationBackend) -> Conversation,
    ) -> (bool, Result<Conversation, ChannelError>) {
        let mut state = self.state.lock().unwrap();
        state.create_requests += 1;
        if state.fail_creates {
            return (state.hold_creates, Err(ChannelError::Rejected("denied".into())));
        }
        let conversation = make(&mut *state);
        (state.hold_creates, Ok(conversation))
    }
}

#[async_trait]
impl RemoteConversationChannel for MockConversationChannel {
    fn subscribe(
        &self,
        user: &UserId,
        sink: SnapshotSink<Conversation>,
    ) -> Result<Subscription, ChannelError> {
        let mut state = self.state.lock().unwrap();
        state.next_sink += 1;
        let id = state.next_sink;
        state.sinks.push((id, user.clone(), sink));
        Ok(detach_on_stop(&self.state, id, |state, id| {
            state.sinks.retain(|(sink_id, _, _)| *sink_id != id);
        }))
    }

    async fn create_direct(
        &self,
        key: &ConversationKey,
        participants: &BTreeSet<UserId>,
    ) -> Result<Conversation, ChannelError> {
        let (hold, result) = self.create(|state| {
            state
                .records
                .entry(key.clone())
                .or_insert_with(|| Conversation {
                    key: key.clone(),
                    kind: ConversationKind::Direct,
                    participant_ids: participants.clone(),
                    title: None,
                    avatar_ref: None,
                    last_message_preview: None,
                    last_message_at: None,
                    pending: false,
                })
                .clone()
        });
        if hold {
            std::future::pending::<()>().await;
        }
        result
    }

    async fn create_group(
        &self,
        title: &str,
        participants: &BTreeSet<UserId>,
    ) -> Result<Conversation, ChannelError> {
        let (hold, result) = self.create(|state| {
            state.next_group += 1;
            let conversation = Conversation {
                key: ConversationKey::new(format!("group-{}", state.next_group)),
                kind: ConversationKind::Group,
                participant_ids: participants.clone(),
                title: Some(title.to_string()),
                avatar_ref: None,
                last_message_preview: None,
                last_message_at: None,
                pending: false,
            };
            state
                .records
                .insert(conversation.key.clone(), conversation.clone());
            conversation
        });
        if hold {
            std::future::pending::<()>().await;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockUploader {
    uploads: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl MockUploader {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl MediaUploader for MockUploader {
    async fn upload(
        &self,
        _bytes: &[u8],
        conversation: &ConversationKey,
        filename: &str,
        _content_type: &str,
    ) -> Result<String, ChannelError> {
        self.uploads.lock().unwrap().push(filename.to_string());
        if *self.fail.lock().unwrap() {
            return Err(ChannelError::Transport("connection reset".into()));
        }
        Ok(format!("media/{conversation}/{filename}"))
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PresenceBackend {
    user_sinks: Sinks<Vec<UserId>, PresenceState>,
    typing_sinks: Sinks<ConversationKey, TypingStatus>,
    next_sink: u64,
    typing_signals: Vec<bool>,
    fail_typing: bool,
    fail_subscribe: bool,
}

#[derive(Default)]
pub struct MockPresenceChannel {
    state: Arc<Mutex<PresenceBackend>>,
}

impl MockPresenceChannel {
    /// Every `set_typing` call in arrival order, failed ones included.
    pub fn typing_signals(&self) -> Vec<bool> {
        self.state.lock().unwrap().typing_signals.clone()
    }

    pub fn fail_typing(&self, fail: bool) {
        self.state.lock().unwrap().fail_typing = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().unwrap().fail_subscribe = fail;
    }

    /// Fail every open typing stream.
    pub fn break_typing(&self, error: ChannelError) {
        let sinks: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.typing_sinks.iter().map(|(_, _, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.fail(error.clone());
        }
    }

    pub fn watched_users(&self) -> Vec<Vec<UserId>> {
        let state = self.state.lock().unwrap();
        state.user_sinks.iter().map(|(_, users, _)| users.clone()).collect()
    }

    pub fn active_subscriptions(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.user_sinks.len() + state.typing_sinks.len()
    }

    pub fn push_presence(&self, states: Vec<PresenceState>) {
        let sinks: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.user_sinks.iter().map(|(_, _, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.snapshot(states.clone());
        }
    }

    pub fn push_typing(&self, statuses: Vec<TypingStatus>) {
        let sinks: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.typing_sinks.iter().map(|(_, _, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.snapshot(statuses.clone());
        }
    }
}

#[async_trait]
impl PresenceChannel for MockPresenceChannel {
    fn subscribe_users(
        &self,
        users: &[UserId],
        sink: SnapshotSink<PresenceState>,
    ) -> Result<Subscription, ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(ChannelError::Unavailable);
        }
        state.next_sink += 1;
        let id = state.next_sink;
        state.user_sinks.push((id, users.to_vec(), sink));
        Ok(detach_on_stop(&self.state, id, |state, id| {
            state.user_sinks.retain(|(sink_id, _, _)| *sink_id != id);
        }))
    }

    fn subscribe_typing(
        &self,
        conversation: &ConversationKey,
        sink: SnapshotSink<TypingStatus>,
    ) -> Result<Subscription, ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(ChannelError::Unavailable);
        }
        state.next_sink += 1;
        let id = state.next_sink;
        state.typing_sinks.push((id, conversation.clone(), sink));
        Ok(detach_on_stop(&self.state, id, |state, id| {
            state.typing_sinks.retain(|(sink_id, _, _)| *sink_id != id);
        }))
    }

    async fn set_typing(
        &self,
        _conversation: &ConversationKey,
        _user: &UserId,
        is_typing: bool,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        state.typing_signals.push(is_typing);
        if state.fail_typing {
            return Err(ChannelError::Timeout);
        }
        Ok(())
    }
}
