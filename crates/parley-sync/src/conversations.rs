//! Conversation list engine.
//!
//! Follows every conversation the local user participates in and creates new
//! ones. Direct conversations have a deterministic key, so they are written
//! to the store as pending records right away and confirmed by key once the
//! backend has created or fetched them. Groups get their key from the
//! backend and only appear once created.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::{ChannelError, ConversationKey, UserId};
use parley_store::Conversation;

use crate::channels::{ChannelEvent, RemoteConversationChannel, SnapshotSink, Subscription};
use crate::error::SyncError;
use crate::reconcile::{plan, Scope};
use crate::{with_store, Result, SharedDatabase};

enum Inbound {
    Conversations(ChannelEvent<Conversation>),
    Created(std::result::Result<Conversation, ChannelError>),
}

struct Envelope {
    session: u64,
    event: Inbound,
}

pub struct ConversationSyncEngine {
    me: UserId,
    store: SharedDatabase,
    channel: Arc<dyn RemoteConversationChannel>,

    inbox_tx: mpsc::UnboundedSender<Envelope>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    session: u64,
    subscription: Option<Subscription>,

    conversations: Vec<Conversation>,
    is_creating: bool,
    last_created: Option<ConversationKey>,
    error_message: Option<String>,
}

impl ConversationSyncEngine {
    pub fn new(
        me: UserId,
        store: SharedDatabase,
        channel: Arc<dyn RemoteConversationChannel>,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            me,
            store,
            channel,
            inbox_tx,
            inbox,
            session: 0,
            subscription: None,
            conversations: Vec::new(),
            is_creating: false,
            last_created: None,
            error_message: None,
        }
    }

    /// Load the cached list and follow the remote one.
    pub fn start(&mut self) -> Result<()> {
        self.stop();
        self.session += 1;
        info!(user = %self.me, session = self.session, "Starting conversation sync");

        self.reload().map_err(|e| self.fail(e))?;

        let tx = self.inbox_tx.clone();
        let session = self.session;
        let sink = SnapshotSink::new(move |event| {
            let _ = tx.send(Envelope {
                session,
                event: Inbound::Conversations(event),
            });
        });
        match self.channel.subscribe(&self.me, sink) {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => {
                self.fail(SyncError::Subscription(e));
            }
        }
        Ok(())
    }

    /// Release the subscription. A creation still in flight is forgotten; a
    /// pending direct conversation it wrote stays in the store.
    pub fn stop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.stop();
            info!(user = %self.me, "Stopped conversation sync");
        }
        self.session += 1;
        self.is_creating = false;
    }

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
            debug!(session = envelope.session, "Dropping event from a previous session");
            return;
        }
        let outcome = match envelope.event {
            Inbound::Conversations(ChannelEvent::Snapshot(batch)) => self.apply_snapshot(batch),
            Inbound::Conversations(ChannelEvent::Failed(e)) => Err(SyncError::Subscription(e)),
            Inbound::Created(result) => self.on_created(result),
        };
        if let Err(e) = outcome {
            self.fail(e);
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Open (or create) the direct conversation with `other`.
    ///
    /// The conversation is visible immediately as a pending record. Returns
    /// its key, or `None` if another creation is in flight.
    pub fn create_direct_conversation(
        &mut self,
        other: &UserId,
    ) -> Result<Option<ConversationKey>> {
        if other.as_str().trim().is_empty() || *other == self.me {
            return Err(self.fail(SyncError::InvalidParticipant(other.to_string())));
        }
        if self.is_creating {
            debug!("Conversation creation already in flight");
            return Ok(None);
        }

        let pending = Conversation::pending_direct(&self.me, other);
        let key = pending.key.clone();

        let existing = with_store(&self.store, |db| db.find_conversation(&key))
            .map_err(|e| self.fail(e))?;
        match existing {
            Some(conversation) if !conversation.pending => {
                debug!(key = %key, "Direct conversation already confirmed");
                self.last_created = Some(key.clone());
                return Ok(Some(key));
            }
            Some(_) => {}
            None => {
                with_store(&self.store, |db| db.insert_conversation(&pending))
                    .map_err(|e| self.fail(e))?;
                self.reload().map_err(|e| self.fail(e))?;
            }
        }

        info!(key = %key, "Creating direct conversation");
        let channel = Arc::clone(&self.channel);
        let participants = pending.participant_ids;
        let request_key = key.clone();
        self.spawn_create(async move {
            channel.create_direct(&request_key, &participants).await
        });
        Ok(Some(key))
    }

    /// Create a group with `participants` (the local user is always added).
    /// Returns `false` if another creation is in flight.
    pub fn create_group_conversation(
        &mut self,
        title: &str,
        participants: BTreeSet<UserId>,
    ) -> Result<bool> {
        let mut participants = participants;
        participants.retain(|id| !id.as_str().trim().is_empty());
        participants.insert(self.me.clone());
        if participants.len() < 2 {
            return Err(self.fail(SyncError::InvalidParticipant(
                "a group needs at least one other participant".into(),
            )));
        }
        if self.is_creating {
            debug!("Conversation creation already in flight");
            return Ok(false);
        }

        let title = title.trim().to_string();
        info!(title = %title, members = participants.len(), "Creating group conversation");
        let channel = Arc::clone(&self.channel);
        self.spawn_create(async move { channel.create_group(&title, &participants).await });
        Ok(true)
    }

    fn spawn_create<F>(&mut self, request: F)
    where
        F: std::future::Future<Output = std::result::Result<Conversation, ChannelError>>
            + Send
            + 'static,
    {
        self.is_creating = true;
        self.error_message = None;
        let tx = self.inbox_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let result = request.await;
            let _ = tx.send(Envelope {
                session,
                event: Inbound::Created(result),
            });
        });
    }

    fn on_created(
        &mut self,
        result: std::result::Result<Conversation, ChannelError>,
    ) -> Result<()> {
        self.is_creating = false;
        let mut created = result.map_err(SyncError::Create)?;
        created.pending = false;
        if !created.has_participant(&self.me) {
            return Err(SyncError::InvalidParticipant(format!(
                "conversation {} does not include {}",
                created.key, self.me
            )));
        }

        let key = created.key.clone();
        self.reconcile(std::slice::from_ref(&created), Scope::Upsert)?;
        info!(key = %key, "Conversation created");
        self.last_created = Some(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    fn apply_snapshot(&mut self, batch: Vec<Conversation>) -> Result<()> {
        let total = batch.len();
        let mine: Vec<Conversation> = batch
            .into_iter()
            .filter(|c| c.has_participant(&self.me))
            .map(|mut c| {
                c.pending = false;
                c
            })
            .collect();
        if mine.len() < total {
            debug!(dropped = total - mine.len(), "Ignoring conversations without the local user");
        }
        self.reconcile(&mine, Scope::Snapshot)
    }

    fn reconcile(&mut self, batch: &[Conversation], scope: Scope) -> Result<()> {
        let me = &self.me;
        let changes = with_store(&self.store, |db| {
            let local = db.conversations_for_user(me)?;
            let changes = plan(&local, batch, scope);
            db.apply_conversation_changes(&changes)?;
            Ok(changes)
        })?;
        debug!(?scope, writes = changes.len(), "Reconciled conversations");
        self.reload()
    }

    fn reload(&mut self) -> Result<()> {
        let me = &self.me;
        self.conversations = with_store(&self.store, |db| db.conversations_for_user(me))?;
        Ok(())
    }

    fn fail(&mut self, error: SyncError) -> SyncError {
        warn!(error = %error, "Conversation sync error");
        self.error_message = Some(error.to_string());
        error
    }

    // ------------------------------------------------------------------
    // Visible state
    // ------------------------------------------------------------------

    /// Conversations of the local user, most recently active first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn is_creating_conversation(&self) -> bool {
        self.is_creating
    }

    /// Key of the conversation most recently created or opened through
    /// this engine.
    pub fn last_created(&self) -> Option<&ConversationKey> {
        self.last_created.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error_message = None;
    }
}
