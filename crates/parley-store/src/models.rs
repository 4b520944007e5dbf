//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::constants::{IMAGE_PREVIEW, MAX_PREVIEW_CHARS};
use parley_shared::{
    ContentType, ConversationKey, ConversationKind, DeliveryStatus, LocalKey, RemoteKey, UserId,
};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A conversation summary (direct chat or group).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Stable identity. Deterministic for direct chats, allocated by the
    /// backend for groups.
    pub key: ConversationKey,
    pub kind: ConversationKind,
    /// Never empty; always contains the local user.
    pub participant_ids: BTreeSet<UserId>,
    pub title: Option<String>,
    pub avatar_ref: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Created locally and not yet confirmed by the backend.
    pub pending: bool,
}

impl Conversation {
    /// A locally created direct conversation awaiting remote confirmation.
    pub fn pending_direct(me: &UserId, other: &UserId) -> Self {
        Self {
            key: ConversationKey::direct(me, other),
            kind: ConversationKind::Direct,
            participant_ids: [me.clone(), other.clone()].into_iter().collect(),
            title: None,
            avatar_ref: None,
            last_message_preview: None,
            last_message_at: None,
            pending: true,
        }
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participant_ids.contains(user)
    }

    /// Participants other than `me`, in identifier order.
    pub fn other_participants<'a>(&'a self, me: &'a UserId) -> impl Iterator<Item = &'a UserId> {
        self.participant_ids.iter().filter(move |id| *id != me)
    }

    /// Title to display: the explicit title if any, otherwise derived from the
    /// other participants (display names preferred over raw identifiers).
    pub fn display_title(&self, me: &UserId, names: &BTreeMap<UserId, String>) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        let others: Vec<&str> = self
            .other_participants(me)
            .map(|id| names.get(id).map(String::as_str).unwrap_or(id.as_str()))
            .collect();
        if others.is_empty() {
            return me.to_string();
        }
        others.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Identity of a message.
///
/// A message created on this device is `Pending` until the backend confirms
/// it; from then on it is addressed by its remote key. Messages authored on
/// other devices may be confirmed without ever having a local key here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MessageIdentity {
    Pending {
        local_key: LocalKey,
    },
    Confirmed {
        remote_key: RemoteKey,
        local_key: Option<LocalKey>,
    },
}

impl MessageIdentity {
    pub fn local_key(&self) -> Option<LocalKey> {
        match self {
            Self::Pending { local_key } => Some(*local_key),
            Self::Confirmed { local_key, .. } => *local_key,
        }
    }

    pub fn remote_key(&self) -> Option<&RemoteKey> {
        match self {
            Self::Pending { .. } => None,
            Self::Confirmed { remote_key, .. } => Some(remote_key),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub identity: MessageIdentity,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub content: String,
    pub content_type: ContentType,
    pub media_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    /// A freshly composed message, visible locally before any network round
    /// trip. The sender has trivially read it.
    pub fn new_pending(
        conversation_key: ConversationKey,
        sender_id: UserId,
        content: impl Into<String>,
        content_type: ContentType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let read_by = std::iter::once(sender_id.clone()).collect();
        Self {
            identity: MessageIdentity::Pending {
                local_key: LocalKey::new(),
            },
            conversation_key,
            sender_id,
            content: content.into(),
            content_type,
            media_ref: None,
            timestamp,
            delivery_status: DeliveryStatus::Sending,
            read_by,
        }
    }

    pub fn local_key(&self) -> Option<LocalKey> {
        self.identity.local_key()
    }

    pub fn remote_key(&self) -> Option<&RemoteKey> {
        self.identity.remote_key()
    }

    pub fn is_pending(&self) -> bool {
        self.identity.is_pending()
    }

    /// Short text used for the conversation summary.
    pub fn preview(&self) -> String {
        match self.content_type {
            ContentType::Image => IMAGE_PREVIEW.to_string(),
            ContentType::Text => self.content.trim().chars().take(MAX_PREVIEW_CHARS).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// Writes to apply to the store as one all-or-nothing unit.
///
/// * `inserts` -- new records.
/// * `updates` -- records rewritten in place, addressed by their current
///   identity.
/// * `promotions` -- pending messages gaining their remote key, addressed by
///   local key.
/// * `deletions` -- records to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<T> {
    pub inserts: Vec<T>,
    pub updates: Vec<T>,
    pub promotions: Vec<T>,
    pub deletions: Vec<T>,
}

impl<T> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.promotions.is_empty()
            && self.deletions.is_empty()
    }

    /// Total number of writes.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.promotions.len() + self.deletions.len()
    }
}

impl<T> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            inserts: Vec::new(),
            updates: Vec::new(),
            promotions: Vec::new(),
            deletions: Vec::new(),
        }
    }
}
