//! Human-readable presence and typing text.
//!
//! A read-only projection over the latest presence and typing snapshots of a
//! conversation's participants. Recomputed on demand; nothing is persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};

use parley_shared::{PresenceState, TypingStatus, UserId};

#[derive(Debug, Clone)]
pub struct PresenceAggregator {
    me: UserId,
    participants: BTreeSet<UserId>,
    names: BTreeMap<UserId, String>,
    presence: HashMap<UserId, PresenceState>,
    typing: HashMap<UserId, TypingStatus>,
    stale_after: Duration,
}

impl PresenceAggregator {
    pub fn new(me: UserId, stale_after: std::time::Duration) -> Self {
        Self {
            me,
            participants: BTreeSet::new(),
            names: BTreeMap::new(),
            presence: HashMap::new(),
            typing: HashMap::new(),
            stale_after: Duration::from_std(stale_after).unwrap_or_else(|_| Duration::days(365)),
        }
    }

    pub fn set_participants(&mut self, participants: BTreeSet<UserId>) {
        self.participants = participants;
    }

    /// Display names from the participant directory.
    pub fn set_names(&mut self, names: BTreeMap<UserId, String>) {
        self.names = names;
    }

    /// Participants other than the local user.
    pub fn others(&self) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|id| **id != self.me)
            .cloned()
            .collect()
    }

    /// Replace the presence set wholesale.
    pub fn apply_presence(&mut self, states: Vec<PresenceState>) {
        self.presence = states
            .into_iter()
            .map(|state| (state.user_id.clone(), state))
            .collect();
    }

    /// Replace the typing set wholesale. The local user's own status is
    /// dropped.
    pub fn apply_typing(&mut self, statuses: Vec<TypingStatus>) {
        self.typing = statuses
            .into_iter()
            .filter(|status| status.user_id != self.me)
            .map(|status| (status.user_id.clone(), status))
            .collect();
    }

    /// `None` when there is nobody else in the conversation.
    pub fn presence_text(&self, now: DateTime<Utc>) -> Option<String> {
        let others = self.others();
        match others.as_slice() {
            [] => None,
            [only] => Some(match self.presence.get(only) {
                Some(state) if state.is_online => "Online".to_string(),
                Some(PresenceState {
                    last_seen_at: Some(seen),
                    ..
                }) => format!("Last seen {}", relative_time(*seen, now)),
                _ => "Offline".to_string(),
            }),
            many => {
                let online = many
                    .iter()
                    .filter(|id| self.presence.get(*id).is_some_and(|s| s.is_online))
                    .count();
                Some(if online == 0 {
                    "No one online".to_string()
                } else if online == many.len() {
                    "All online".to_string()
                } else {
                    format!("{online} online")
                })
            }
        }
    }

    /// Other users currently typing, in identifier order.
    pub fn typing_users(&self, now: DateTime<Utc>) -> Vec<&UserId> {
        let mut users: Vec<&UserId> = self
            .typing
            .values()
            .filter(|status| status.is_typing && now - status.updated_at <= self.stale_after)
            .map(|status| &status.user_id)
            .collect();
        users.sort();
        users
    }

    /// `None` when nobody else is typing.
    pub fn typing_text(&self, now: DateTime<Utc>) -> Option<String> {
        let typing = self.typing_users(now);
        if typing.is_empty() {
            return None;
        }

        let total = self.participants.len().max(typing.len() + 1);
        if total <= 2 {
            return Some("typing...".to_string());
        }

        let names: Option<Vec<&str>> = typing
            .iter()
            .map(|id| self.names.get(*id).map(String::as_str))
            .collect();
        Some(match names.as_deref() {
            Some([one]) => format!("{one} is typing..."),
            Some([first, second]) => format!("{first} and {second} are typing..."),
            _ => "Several people are typing...".to_string(),
        })
    }
}

/// Coarse "time ago" text.
pub fn relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - then;
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();

    if minutes < 1 {
        "just now".to_string()
    } else if hours < 1 {
        plural(minutes, "minute")
    } else if days < 1 {
        plural(hours, "hour")
    } else {
        plural(days, "day")
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}
