//! Capabilities the sync engines consume.
//!
//! The remote backend is an opaque collaborator: it pushes full snapshots to
//! a [`SnapshotSink`] and accepts writes through async request methods. A
//! subscription is an explicit [`Subscription`] handle that releases the
//! remote listener when stopped or dropped.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_shared::{
    ChannelError, ContentType, ConversationKey, LocalKey, PresenceState, RemoteKey, TypingStatus,
    UserId,
};
use parley_store::{Conversation, Message};

// ---------------------------------------------------------------------------
// Snapshot delivery
// ---------------------------------------------------------------------------

/// One push from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<T> {
    /// Full current listing of the subscribed scope.
    Snapshot(Vec<T>),
    /// The listener failed; no further snapshots will follow.
    Failed(ChannelError),
}

/// Callback a remote channel pushes events into.
///
/// Sinks may be invoked from any thread. Engines only enqueue the event;
/// state is touched later on the engine's own task.
pub struct SnapshotSink<T> {
    deliver: Arc<dyn Fn(ChannelEvent<T>) + Send + Sync>,
}

impl<T> SnapshotSink<T> {
    pub fn new(deliver: impl Fn(ChannelEvent<T>) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn snapshot(&self, items: Vec<T>) {
        (self.deliver)(ChannelEvent::Snapshot(items));
    }

    pub fn fail(&self, error: ChannelError) {
        (self.deliver)(ChannelEvent::Failed(error));
    }
}

impl<T> Clone for SnapshotSink<T> {
    fn clone(&self) -> Self {
        Self {
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<T> fmt::Debug for SnapshotSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSink").finish_non_exhaustive()
    }
}

/// Scoped handle to a remote listener.
///
/// The listener is released exactly once: by [`Subscription::stop`] or, failing
/// that, when the handle is dropped.
#[must_use = "dropping a subscription stops it"]
pub struct Subscription {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// A handle with nothing to release.
    pub fn detached() -> Self {
        Self { stop: None }
    }

    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A message handed to the backend for confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub content: String,
    pub content_type: ContentType,
    /// Echoed back on the confirmed record so the pending copy can be
    /// promoted.
    pub local_key: LocalKey,
    pub media_ref: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl OutgoingMessage {
    /// Request for a pending message. `None` if the message is already
    /// confirmed.
    pub fn from_pending(message: &Message) -> Option<Self> {
        if !message.is_pending() {
            return None;
        }
        Some(Self {
            conversation_key: message.conversation_key.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            content_type: message.content_type,
            local_key: message.local_key()?,
            media_ref: message.media_ref.clone(),
            sent_at: message.timestamp,
        })
    }
}

/// Image bytes picked by the user, ready for upload.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    /// MIME type, e.g. `image/jpeg`.
    pub content_type: String,
}

impl fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageUpload")
            .field("len", &self.bytes.len())
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Remote message stream and writes for one user.
#[async_trait]
pub trait RemoteMessageChannel: Send + Sync {
    /// Listen to the full message list of `conversation`.
    fn subscribe(
        &self,
        conversation: &ConversationKey,
        sink: SnapshotSink<Message>,
    ) -> Result<Subscription, ChannelError>;

    /// Write a message and return the confirmed record, which must carry the
    /// request's local key.
    async fn send(&self, message: OutgoingMessage) -> Result<Message, ChannelError>;

    /// Record that `reader` has read the given messages.
    async fn mark_read(
        &self,
        conversation: &ConversationKey,
        remote_keys: &[RemoteKey],
        reader: &UserId,
    ) -> Result<(), ChannelError>;
}

/// Remote conversation list and creation.
#[async_trait]
pub trait RemoteConversationChannel: Send + Sync {
    /// Listen to every conversation `user` participates in.
    fn subscribe(
        &self,
        user: &UserId,
        sink: SnapshotSink<Conversation>,
    ) -> Result<Subscription, ChannelError>;

    /// Create the direct conversation stored under `key`, or return it if it
    /// already exists.
    async fn create_direct(
        &self,
        key: &ConversationKey,
        participants: &BTreeSet<UserId>,
    ) -> Result<Conversation, ChannelError>;

    /// Create a group; the backend allocates its key.
    async fn create_group(
        &self,
        title: &str,
        participants: &BTreeSet<UserId>,
    ) -> Result<Conversation, ChannelError>;
}

/// Media storage. Optional: without it, image messages are unavailable.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Store `bytes` and return a reference messages can point to.
    async fn upload(
        &self,
        bytes: &[u8],
        conversation: &ConversationKey,
        filename: &str,
        content_type: &str,
    ) -> Result<String, ChannelError>;
}

/// Low-latency presence and typing channel. Optional.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    fn subscribe_users(
        &self,
        users: &[UserId],
        sink: SnapshotSink<PresenceState>,
    ) -> Result<Subscription, ChannelError>;

    fn subscribe_typing(
        &self,
        conversation: &ConversationKey,
        sink: SnapshotSink<TypingStatus>,
    ) -> Result<Subscription, ChannelError>;

    async fn set_typing(
        &self,
        conversation: &ConversationKey,
        user: &UserId,
        is_typing: bool,
    ) -> Result<(), ChannelError>;
}
