//! Message sync engine for one open conversation.
//!
//! Outgoing messages are written to the store as pending records before any
//! network round trip and promoted in place once the backend confirms them.
//! Incoming snapshots are reconciled into the store and the visible list is
//! always reloaded from the store afterwards.
//!
//! Remote pushes, send and upload completions and typing timer expiries are
//! queued on the engine's inbox and applied by [`MessageSyncEngine::process_next`]
//! or [`MessageSyncEngine::drain`]. Each `start` opens a new session; events
//! queued by an earlier session are dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::{
    ChannelError, ContentType, ConversationKey, LocalKey, PresenceState, RemoteKey, TypingStatus,
    UserId,
};
use parley_store::{ChangeSet, Message, MessageIdentity};

use crate::channels::{
    ChannelEvent, ImageUpload, MediaUploader, OutgoingMessage, PresenceChannel,
    RemoteMessageChannel, SnapshotSink, Subscription,
};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::presence::PresenceAggregator;
use crate::reconcile::{plan, Scope};
use crate::typing::TypingBroadcaster;
use crate::{with_store, Result, SharedDatabase};

/// Remote collaborators of a [`MessageSyncEngine`].
#[derive(Clone)]
pub struct MessageServices {
    pub messages: Arc<dyn RemoteMessageChannel>,
    pub uploader: Option<Arc<dyn MediaUploader>>,
    pub presence: Option<Arc<dyn PresenceChannel>>,
}

impl MessageServices {
    pub fn new(messages: Arc<dyn RemoteMessageChannel>) -> Self {
        Self {
            messages,
            uploader: None,
            presence: None,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn MediaUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceChannel>) -> Self {
        self.presence = Some(presence);
        self
    }
}

enum Inbound {
    Messages(ChannelEvent<Message>),
    Presence(ChannelEvent<PresenceState>),
    Typing(ChannelEvent<TypingStatus>),
    TypingExpired(u64),
    Uploaded {
        local_key: LocalKey,
        result: std::result::Result<String, ChannelError>,
    },
    Sent {
        local_key: LocalKey,
        result: std::result::Result<Message, ChannelError>,
    },
}

struct Envelope {
    session: u64,
    event: Inbound,
}

/// Posts events into the inbox on behalf of one session.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
    session: u64,
}

impl Outbox {
    fn post(&self, event: Inbound) {
        // The engine may already be gone; nothing left to update then.
        let _ = self.tx.send(Envelope {
            session: self.session,
            event,
        });
    }
}

pub struct MessageSyncEngine {
    me: UserId,
    store: SharedDatabase,
    services: MessageServices,
    config: SyncConfig,

    inbox_tx: mpsc::UnboundedSender<Envelope>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    session: u64,

    conversation: Option<ConversationKey>,
    subscriptions: Vec<Subscription>,
    typing: Option<TypingBroadcaster>,
    presence_view: PresenceAggregator,
    /// Picked images whose upload has not succeeded yet, kept for retries.
    staged_media: HashMap<LocalKey, ImageUpload>,

    messages: Vec<Message>,
    is_sending: bool,
    is_uploading_media: bool,
    error_message: Option<String>,
    needs_retry: BTreeSet<LocalKey>,
}

impl MessageSyncEngine {
    pub fn new(
        me: UserId,
        store: SharedDatabase,
        services: MessageServices,
        config: SyncConfig,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let presence_view = PresenceAggregator::new(me.clone(), config.typing_stale_after);
        Self {
            me,
            store,
            services,
            config,
            inbox_tx,
            inbox,
            session: 0,
            conversation: None,
            subscriptions: Vec::new(),
            typing: None,
            presence_view,
            staged_media: HashMap::new(),
            messages: Vec::new(),
            is_sending: false,
            is_uploading_media: false,
            error_message: None,
            needs_retry: BTreeSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open `conversation`: show what the store has, then follow the remote
    /// stream. A previously open conversation is stopped first.
    ///
    /// Pending messages found in the store were orphaned by an earlier run
    /// and are marked as needing a retry. A subscription that cannot be
    /// opened (messages, presence or typing) is reported through
    /// [`error_message`](Self::error_message); the cached view stays usable.
    pub fn start(&mut self, conversation: ConversationKey) -> Result<()> {
        self.stop();
        self.session += 1;
        info!(conversation = %conversation, session = self.session, "Starting message sync");

        let (messages, participants) = with_store(&self.store, |db| {
            let messages = db.messages_for_conversation(&conversation)?;
            let participants = db
                .find_conversation(&conversation)?
                .map(|c| c.participant_ids)
                .unwrap_or_default();
            Ok((messages, participants))
        })
        .map_err(|e| self.fail(e))?;

        self.needs_retry = messages
            .iter()
            .filter(|m| m.is_pending())
            .filter_map(Message::local_key)
            .collect();
        if !self.needs_retry.is_empty() {
            info!(count = self.needs_retry.len(), "Found unsent messages from a previous run");
        }
        self.messages = messages;
        self.presence_view.set_participants(participants);
        self.conversation = Some(conversation.clone());

        match self
            .services
            .messages
            .subscribe(&conversation, self.sink(Inbound::Messages))
        {
            Ok(subscription) => self.subscriptions.push(subscription),
            Err(e) => {
                self.fail(SyncError::Subscription(e));
            }
        }

        if let Some(presence) = self.services.presence.clone() {
            let others = self.presence_view.others();
            if !others.is_empty() {
                match presence.subscribe_users(&others, self.sink(Inbound::Presence)) {
                    Ok(subscription) => self.subscriptions.push(subscription),
                    Err(e) => {
                        self.fail(SyncError::Subscription(e));
                    }
                }
            }
            match presence.subscribe_typing(&conversation, self.sink(Inbound::Typing)) {
                Ok(subscription) => self.subscriptions.push(subscription),
                Err(e) => {
                    self.fail(SyncError::Subscription(e));
                }
            }
        }

        let outbox = self.outbox();
        self.typing = Some(TypingBroadcaster::new(
            conversation,
            self.me.clone(),
            self.services.presence.clone(),
            self.config.typing_timeout,
            move |generation| outbox.post(Inbound::TypingExpired(generation)),
        ));

        Ok(())
    }

    /// Release every subscription, retract typing and forget the open
    /// conversation. In-flight sends keep running but their results are
    /// dropped; the pending records stay in the store.
    pub fn stop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.stop();
        }
        if let Some(mut typing) = self.typing.take() {
            typing.shutdown();
        }
        if let Some(conversation) = self.conversation.take() {
            info!(conversation = %conversation, "Stopped message sync");
            self.session += 1;
        }

        self.presence_view =
            PresenceAggregator::new(self.me.clone(), self.config.typing_stale_after);
        self.staged_media.clear();
        self.messages.clear();
        self.needs_retry.clear();
        self.is_sending = false;
        self.is_uploading_media = false;
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    /// Wait for the next queued event and apply it.
    pub async fn process_next(&mut self) {
        if let Some(envelope) = self.inbox.recv().await {
            self.handle(envelope);
        }
    }

    /// Apply every event queued so far. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(envelope) = self.inbox.try_recv() {
            self.handle(envelope);
            applied += 1;
        }
        applied
    }

    fn handle(&mut self, envelope: Envelope) {
        if envelope.session != self.session {
            debug!(
                session = envelope.session,
                current = self.session,
                "Dropping event from a previous session"
            );
            return;
        }

        let outcome = match envelope.event {
            Inbound::Messages(ChannelEvent::Snapshot(batch)) => self.apply_snapshot(batch),
            Inbound::Messages(ChannelEvent::Failed(e)) => Err(SyncError::Subscription(e)),
            Inbound::Presence(ChannelEvent::Snapshot(states)) => {
                self.presence_view.apply_presence(states);
                Ok(())
            }
            Inbound::Typing(ChannelEvent::Snapshot(statuses)) => {
                self.presence_view.apply_typing(statuses);
                Ok(())
            }
            Inbound::Presence(ChannelEvent::Failed(e))
            | Inbound::Typing(ChannelEvent::Failed(e)) => Err(SyncError::Subscription(e)),
            Inbound::TypingExpired(generation) => {
                if let Some(typing) = self.typing.as_mut() {
                    typing.expired(generation);
                }
                Ok(())
            }
            Inbound::Uploaded { local_key, result } => self.on_uploaded(local_key, result),
            Inbound::Sent { local_key, result } => self.on_sent(local_key, result),
        };

        if let Err(e) = outcome {
            self.fail(e);
        }
    }

    fn outbox(&self) -> Outbox {
        Outbox {
            tx: self.inbox_tx.clone(),
            session: self.session,
        }
    }

    fn sink<T: 'static>(&self, wrap: fn(ChannelEvent<T>) -> Inbound) -> SnapshotSink<T> {
        let outbox = self.outbox();
        SnapshotSink::new(move |event| outbox.post(wrap(event)))
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a text message. Returns the local key of the new pending record,
    /// or `None` if nothing was sent because the text is blank or another
    /// send is in flight.
    pub fn send_text(&mut self, content: &str) -> Result<Option<LocalKey>> {
        let conversation = self.conversation.clone().ok_or(SyncError::NotStarted)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        if self.is_sending {
            debug!("Send already in flight, ignoring");
            return Ok(None);
        }

        self.stop_typing();
        let message = Message::new_pending(
            conversation,
            self.me.clone(),
            content,
            ContentType::Text,
            Utc::now(),
        );
        self.insert_pending(&message)?;

        self.error_message = None;
        self.is_sending = true;
        self.dispatch_send(&message);
        Ok(message.local_key())
    }

    /// Upload `image` and send it as an image message.
    ///
    /// Without a configured uploader this fails before touching the store.
    pub fn send_image(&mut self, image: ImageUpload) -> Result<Option<LocalKey>> {
        let conversation = self.conversation.clone().ok_or(SyncError::NotStarted)?;
        let Some(uploader) = self.services.uploader.clone() else {
            return Err(self.fail(SyncError::UploadUnavailable));
        };
        if self.is_sending {
            debug!("Send already in flight, ignoring image");
            return Ok(None);
        }

        self.stop_typing();
        let message = Message::new_pending(
            conversation,
            self.me.clone(),
            String::new(),
            ContentType::Image,
            Utc::now(),
        );
        let Some(local_key) = message.local_key() else {
            return Ok(None);
        };
        self.insert_pending(&message)?;

        self.error_message = None;
        self.is_sending = true;
        self.start_upload(uploader, local_key, image);
        Ok(Some(local_key))
    }

    /// The user cancelled image selection or the picker failed. Nothing was
    /// written, so there is nothing to undo.
    pub fn media_selection_failed(&self, reason: &str) {
        debug!(reason, "Image selection failed");
    }

    /// Resend a pending message whose previous attempt failed, reusing its
    /// local key. Returns `false` if another send is in flight or the message
    /// got confirmed in the meantime.
    pub fn retry_send(&mut self, local_key: LocalKey) -> Result<bool> {
        let conversation = self.conversation.clone().ok_or(SyncError::NotStarted)?;
        if self.is_sending {
            return Ok(false);
        }
        if !self.needs_retry.contains(&local_key) {
            return Err(SyncError::UnknownPending(local_key));
        }

        let message = with_store(&self.store, |db| {
            db.message_by_local_key(&conversation, local_key)
        })
        .map_err(|e| self.fail(e))?;
        if !message.is_pending() {
            self.needs_retry.remove(&local_key);
            return Ok(false);
        }

        info!(local_key = %local_key, "Retrying message");
        if message.content_type == ContentType::Image && message.media_ref.is_none() {
            let Some(uploader) = self.services.uploader.clone() else {
                return Err(self.fail(SyncError::UploadUnavailable));
            };
            let Some(image) = self.staged_media.get(&local_key).cloned() else {
                return Err(self.fail(SyncError::MediaMissing));
            };
            self.needs_retry.remove(&local_key);
            self.error_message = None;
            self.is_sending = true;
            self.start_upload(uploader, local_key, image);
        } else {
            self.needs_retry.remove(&local_key);
            self.error_message = None;
            self.is_sending = true;
            self.dispatch_send(&message);
        }
        Ok(true)
    }

    fn insert_pending(&mut self, message: &Message) -> Result<()> {
        with_store(&self.store, |db| db.insert_message(message)).map_err(|e| self.fail(e))?;
        debug!(local_key = ?message.local_key(), "Stored pending message");
        self.refresh().map_err(|e| self.fail(e))
    }

    fn start_upload(
        &mut self,
        uploader: Arc<dyn MediaUploader>,
        local_key: LocalKey,
        image: ImageUpload,
    ) {
        let Some(conversation) = self.conversation.clone() else {
            return;
        };
        self.is_uploading_media = true;
        self.staged_media.insert(local_key, image.clone());

        let outbox = self.outbox();
        debug!(local_key = %local_key, size = image.bytes.len(), "Uploading image");
        tokio::spawn(async move {
            let result = uploader
                .upload(
                    &image.bytes,
                    &conversation,
                    &image.filename,
                    &image.content_type,
                )
                .await;
            outbox.post(Inbound::Uploaded { local_key, result });
        });
    }

    fn dispatch_send(&mut self, message: &Message) {
        let Some(request) = OutgoingMessage::from_pending(message) else {
            self.is_sending = false;
            return;
        };
        let local_key = request.local_key;
        let channel = Arc::clone(&self.services.messages);
        let outbox = self.outbox();
        debug!(local_key = %local_key, "Sending message");
        tokio::spawn(async move {
            let result = channel.send(request).await;
            outbox.post(Inbound::Sent { local_key, result });
        });
    }

    fn on_uploaded(
        &mut self,
        local_key: LocalKey,
        result: std::result::Result<String, ChannelError>,
    ) -> Result<()> {
        self.is_uploading_media = false;
        let media_ref = match result {
            Ok(media_ref) => media_ref,
            Err(e) => {
                self.is_sending = false;
                self.needs_retry.insert(local_key);
                return Err(SyncError::Upload(e));
            }
        };

        let conversation = self.conversation.clone().ok_or(SyncError::NotStarted)?;
        let stored = with_store(&self.store, |db| {
            let mut message = db.message_by_local_key(&conversation, local_key)?;
            message.media_ref = Some(media_ref);
            db.update_message(&message)?;
            Ok(message)
        });
        let message = match stored {
            Ok(message) => message,
            Err(e) => {
                self.is_sending = false;
                self.needs_retry.insert(local_key);
                return Err(e);
            }
        };

        debug!(local_key = %local_key, media_ref = ?message.media_ref, "Image uploaded");
        self.staged_media.remove(&local_key);
        self.dispatch_send(&message);
        self.refresh()
    }

    fn on_sent(
        &mut self,
        local_key: LocalKey,
        result: std::result::Result<Message, ChannelError>,
    ) -> Result<()> {
        self.is_sending = false;
        let mut confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.needs_retry.insert(local_key);
                return Err(SyncError::Send(e));
            }
        };

        // Promotion is by local key; make sure the confirmation carries it.
        if let MessageIdentity::Confirmed {
            local_key: echoed, ..
        } = &mut confirmed.identity
        {
            if echoed.is_none() {
                *echoed = Some(local_key);
            }
        }
        info!(local_key = %local_key, remote_key = ?confirmed.remote_key(), "Message confirmed");

        self.needs_retry.remove(&local_key);
        let conversation = self.conversation.clone().ok_or(SyncError::NotStarted)?;
        self.reconcile(&conversation, std::slice::from_ref(&confirmed), Scope::Upsert)
    }

    // ------------------------------------------------------------------
    // Read receipts and typing
    // ------------------------------------------------------------------

    /// Mark every confirmed message from other senders as read by the local
    /// user. The store is updated right away; the backend is notified in the
    /// background and failures there are only logged. Returns how many
    /// messages changed.
    pub fn mark_read(&mut self) -> Result<usize> {
        let conversation = self.conversation.clone().ok_or(SyncError::NotStarted)?;

        let mut changes = ChangeSet::default();
        for message in &self.messages {
            if message.is_pending()
                || message.sender_id == self.me
                || message.read_by.contains(&self.me)
            {
                continue;
            }
            let mut read = message.clone();
            read.read_by.insert(self.me.clone());
            changes.updates.push(read);
        }
        if changes.is_empty() {
            return Ok(0);
        }

        with_store(&self.store, |db| db.apply_message_changes(&changes))
            .map_err(|e| self.fail(e))?;
        self.refresh().map_err(|e| self.fail(e))?;

        let remote_keys: Vec<RemoteKey> = changes
            .updates
            .iter()
            .filter_map(|m| m.remote_key().cloned())
            .collect();
        let count = remote_keys.len();
        let channel = Arc::clone(&self.services.messages);
        let reader = self.me.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.mark_read(&conversation, &remote_keys, &reader).await {
                debug!(error = %e, "Read receipt not delivered");
            }
        });
        Ok(count)
    }

    /// The composer text changed.
    pub fn input_changed(&mut self, text: &str) {
        if let Some(typing) = self.typing.as_mut() {
            typing.input_changed(text);
        }
    }

    fn stop_typing(&mut self) {
        if let Some(typing) = self.typing.as_mut() {
            typing.stop();
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    fn apply_snapshot(&mut self, batch: Vec<Message>) -> Result<()> {
        let Some(conversation) = self.conversation.clone() else {
            return Ok(());
        };
        let (batch, foreign): (Vec<Message>, Vec<Message>) = batch
            .into_iter()
            .partition(|m| m.conversation_key == conversation);
        if !foreign.is_empty() {
            warn!(count = foreign.len(), "Ignoring messages of another conversation");
        }
        self.reconcile(&conversation, &batch, Scope::Snapshot)
    }

    fn reconcile(
        &mut self,
        conversation: &ConversationKey,
        batch: &[Message],
        scope: Scope,
    ) -> Result<()> {
        let changes = with_store(&self.store, |db| {
            let local = db.messages_for_conversation(conversation)?;
            let changes = plan(&local, batch, scope);
            db.apply_message_changes(&changes)?;
            Ok(changes)
        })?;
        debug!(
            conversation = %conversation,
            ?scope,
            writes = changes.len(),
            "Reconciled messages"
        );
        self.refresh()
    }

    /// Refresh the conversation summary and reload the visible list.
    fn refresh(&mut self) -> Result<()> {
        let Some(conversation) = self.conversation.as_ref() else {
            return Ok(());
        };
        let messages = with_store(&self.store, |db| {
            if let Some(latest) = db.latest_message(conversation)? {
                db.update_conversation_summary(
                    conversation,
                    Some(&latest.preview()),
                    Some(latest.timestamp),
                )?;
            }
            db.messages_for_conversation(conversation)
        })?;

        let pending: BTreeSet<LocalKey> = messages
            .iter()
            .filter(|m| m.is_pending())
            .filter_map(Message::local_key)
            .collect();
        self.needs_retry.retain(|key| pending.contains(key));
        self.staged_media.retain(|key, _| pending.contains(key));
        self.messages = messages;
        Ok(())
    }

    fn fail(&mut self, error: SyncError) -> SyncError {
        warn!(error = %error, "Message sync error");
        self.error_message = Some(error.to_string());
        error
    }

    // ------------------------------------------------------------------
    // Visible state
    // ------------------------------------------------------------------

    pub fn conversation(&self) -> Option<&ConversationKey> {
        self.conversation.as_ref()
    }

    /// Messages of the open conversation, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending
    }

    pub fn is_uploading_media(&self) -> bool {
        self.is_uploading_media
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error_message = None;
    }

    /// Pending messages the user has to resend.
    pub fn needs_retry(&self) -> impl Iterator<Item = &LocalKey> {
        self.needs_retry.iter()
    }

    pub fn set_participant_names(&mut self, names: BTreeMap<UserId, String>) {
        self.presence_view.set_names(names);
    }

    pub fn presence_text(&self) -> Option<String> {
        self.presence_view.presence_text(Utc::now())
    }

    pub fn typing_text(&self) -> Option<String> {
        self.presence_view.typing_text(Utc::now())
    }
}

impl Drop for MessageSyncEngine {
    fn drop(&mut self) {
        if let Some(typing) = self.typing.as_mut() {
            typing.shutdown();
        }
    }
}
