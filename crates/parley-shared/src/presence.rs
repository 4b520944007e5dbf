use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationKey, UserId};

/// Online status of one user as last pushed by the presence channel.
///
/// Never persisted; every push replaces the previous value wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceState {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Whether a user is currently composing a message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingStatus {
    pub user_id: UserId,
    pub conversation_key: ConversationKey,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}
