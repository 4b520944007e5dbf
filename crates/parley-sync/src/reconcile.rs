//! Identity reconciliation.
//!
//! Maps a batch of remote records onto the locally held set using the
//! dual-key scheme: a stable remote key once the backend has confirmed a
//! record, and a client-generated local key before that. The output is a
//! [`ChangeSet`] for the store; nothing here performs I/O.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use parley_shared::LocalKey;
use parley_store::{ChangeSet, Conversation, Message, MessageIdentity};

/// How authoritative an incoming batch is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Full current listing: confirmed local records missing from it are
    /// gone server-side and get deleted.
    Snapshot,
    /// Partial batch (e.g. one send confirmation): nothing is deleted.
    Upsert,
}

/// A record the reconciler can match against remote data.
pub trait SyncRecord: Clone + PartialEq {
    type Key: Eq + Hash + Clone + Debug;

    /// Confirmed identity, `None` while the record exists only locally.
    fn remote_key(&self) -> Option<&Self::Key>;

    /// Client-generated identity used to promote pending records.
    fn local_key(&self) -> Option<LocalKey> {
        None
    }

    /// Pending records are never deleted by a snapshot pass.
    fn is_pending(&self) -> bool {
        self.remote_key().is_none()
    }

    /// Fold the server version `incoming` into the stored record `self`.
    /// Server fields win; local identity is kept.
    fn absorb(&self, incoming: &Self) -> Self;
}

impl SyncRecord for Message {
    type Key = parley_shared::RemoteKey;

    fn remote_key(&self) -> Option<&Self::Key> {
        self.identity.remote_key()
    }

    fn local_key(&self) -> Option<LocalKey> {
        self.identity.local_key()
    }

    fn absorb(&self, incoming: &Self) -> Self {
        let mut merged = incoming.clone();
        if let Some(remote_key) = incoming.remote_key() {
            merged.identity = MessageIdentity::Confirmed {
                remote_key: remote_key.clone(),
                local_key: self.local_key().or_else(|| incoming.local_key()),
            };
        }
        merged.conversation_key = self.conversation_key.clone();
        merged
    }
}

impl SyncRecord for Conversation {
    type Key = parley_shared::ConversationKey;

    fn remote_key(&self) -> Option<&Self::Key> {
        Some(&self.key)
    }

    fn is_pending(&self) -> bool {
        self.pending
    }

    fn absorb(&self, incoming: &Self) -> Self {
        let mut merged = incoming.clone();
        merged.pending = false;

        // The summary is also maintained locally from message syncs; keep
        // whichever side saw the newer message.
        let local_is_newer = match (self.last_message_at, incoming.last_message_at) {
            (Some(_), None) => true,
            (Some(local), Some(remote)) => local > remote,
            _ => false,
        };
        if local_is_newer {
            merged.last_message_at = self.last_message_at;
            merged.last_message_preview = self.last_message_preview.clone();
        }
        merged
    }
}

/// Compute the writes that bring `local` in line with `batch`.
///
/// For every incoming record, in order:
/// 1. a local record with the same remote key is updated in place (no write
///    if nothing changed),
/// 2. otherwise a pending local record with the same local key is promoted,
/// 3. otherwise the record is inserted.
///
/// With [`Scope::Snapshot`], confirmed local records whose remote key does not
/// appear in `batch` are deleted. Incoming records without a remote key are
/// ignored, and duplicate keys collapse to their last occurrence.
pub fn plan<T: SyncRecord>(local: &[T], batch: &[T], scope: Scope) -> ChangeSet<T> {
    let mut by_remote: HashMap<&T::Key, &T> = HashMap::new();
    let mut pending_by_local: HashMap<LocalKey, &T> = HashMap::new();
    for record in local {
        if let Some(key) = record.remote_key() {
            by_remote.insert(key, record);
        }
        if record.is_pending() {
            if let Some(local_key) = record.local_key() {
                pending_by_local.insert(local_key, record);
            }
        }
    }

    let incoming = dedup_last(batch);
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&T::Key> = HashSet::new();

    for record in incoming {
        let Some(key) = record.remote_key() else {
            continue;
        };
        seen.insert(key);

        if let Some(existing) = by_remote.get(key) {
            // The record was listed without its local key before the
            // confirmation arrived; the pending copy is now a duplicate.
            if let Some(duplicate) = record
                .local_key()
                .filter(|local_key| existing.local_key() != Some(*local_key))
                .and_then(|local_key| pending_by_local.remove(&local_key))
            {
                changes.deletions.push(duplicate.clone());
            }
            let merged = existing.absorb(record);
            if merged != **existing {
                changes.updates.push(merged);
            }
        } else if let Some(existing) = record
            .local_key()
            .and_then(|local_key| pending_by_local.remove(&local_key))
        {
            changes.promotions.push(existing.absorb(record));
        } else {
            changes.inserts.push(record.clone());
        }
    }

    if scope == Scope::Snapshot {
        for record in local {
            if record.is_pending() {
                continue;
            }
            if let Some(key) = record.remote_key() {
                if !seen.contains(key) {
                    changes.deletions.push(record.clone());
                }
            }
        }
    }

    changes
}

/// Keep the last occurrence of each remote key, preserving batch order.
fn dedup_last<T: SyncRecord>(batch: &[T]) -> Vec<&T> {
    let mut seen = HashSet::new();
    let mut kept: Vec<&T> = batch
        .iter()
        .rev()
        .filter(|record| match record.remote_key() {
            Some(key) => seen.insert(key),
            None => {
                tracing::warn!("ignoring remote record without remote key");
                false
            }
        })
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{DateTime, Duration, Utc};
    use parley_shared::{
        ContentType, ConversationKey, ConversationKind, DeliveryStatus, RemoteKey, UserId,
    };

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_731_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn remote(key: &str, content: &str, secs: i64) -> Message {
        Message {
            identity: MessageIdentity::Confirmed {
                remote_key: RemoteKey::new(key),
                local_key: None,
            },
            conversation_key: ConversationKey::new("c1"),
            sender_id: UserId::new("bob"),
            content: content.into(),
            content_type: ContentType::Text,
            media_ref: None,
            timestamp: at(secs),
            delivery_status: DeliveryStatus::Sent,
            read_by: BTreeSet::new(),
        }
    }

    fn pending(content: &str, secs: i64) -> Message {
        Message::new_pending(
            ConversationKey::new("c1"),
            UserId::new("me"),
            content,
            ContentType::Text,
            at(secs),
        )
    }

    fn confirm(pending: &Message, key: &str) -> Message {
        let mut confirmed = pending.clone();
        confirmed.identity = MessageIdentity::Confirmed {
            remote_key: RemoteKey::new(key),
            local_key: pending.local_key(),
        };
        confirmed.delivery_status = DeliveryStatus::Sent;
        confirmed
    }

    /// Apply a change set to an in-memory vector the way the store would.
    fn apply(local: &mut Vec<Message>, changes: &ChangeSet<Message>) {
        local.retain(|m| !changes.deletions.contains(m));
        for promoted in &changes.promotions {
            let slot = local
                .iter_mut()
                .find(|m| m.is_pending() && m.local_key() == promoted.local_key())
                .unwrap();
            *slot = promoted.clone();
        }
        for updated in &changes.updates {
            let slot = local
                .iter_mut()
                .find(|m| m.remote_key() == updated.remote_key())
                .unwrap();
            *slot = updated.clone();
        }
        local.extend(changes.inserts.iter().cloned());
    }

    #[test]
    fn inserts_unknown_records() {
        let changes = plan(&[], &[remote("r1", "a", 0), remote("r2", "b", 1)], Scope::Snapshot);
        assert_eq!(changes.inserts.len(), 2);
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn updates_in_place_without_replacing_identity() {
        let mut local = remote("r1", "old", 0);
        local.identity = MessageIdentity::Confirmed {
            remote_key: RemoteKey::new("r1"),
            local_key: Some(LocalKey::new()),
        };
        let mut incoming = remote("r1", "edited", 0);
        incoming.delivery_status = DeliveryStatus::Read;

        let changes = plan(&[local.clone()], &[incoming], Scope::Snapshot);
        assert_eq!(changes.updates.len(), 1);
        let updated = &changes.updates[0];
        assert_eq!(updated.content, "edited");
        assert_eq!(updated.delivery_status, DeliveryStatus::Read);
        assert_eq!(updated.local_key(), local.local_key());
    }

    #[test]
    fn promotes_pending_by_local_key() {
        let local = pending("hi", 5);
        let changes = plan(&[local.clone()], &[confirm(&local, "r9")], Scope::Snapshot);

        assert!(changes.inserts.is_empty());
        assert!(changes.deletions.is_empty());
        assert_eq!(changes.promotions.len(), 1);
        assert_eq!(
            changes.promotions[0].remote_key(),
            Some(&RemoteKey::new("r9"))
        );
        assert_eq!(changes.promotions[0].local_key(), local.local_key());
    }

    #[test]
    fn confirmation_after_anonymous_listing_drops_the_pending_copy() {
        let mine = pending("hi", 5);
        let mut listed = confirm(&mine, "r1");
        listed.identity = MessageIdentity::Confirmed {
            remote_key: RemoteKey::new("r1"),
            local_key: None,
        };

        // The listing arrives first and is stored as a separate row.
        let mut local = vec![mine.clone()];
        let first = plan(&local, std::slice::from_ref(&listed), Scope::Snapshot);
        assert_eq!(first.inserts.len(), 1);
        apply(&mut local, &first);
        assert_eq!(local.len(), 2);

        let second = plan(&local, &[confirm(&mine, "r1")], Scope::Upsert);
        assert_eq!(second.deletions, vec![mine.clone()]);
        assert_eq!(second.updates.len(), 1);
        assert_eq!(second.updates[0].local_key(), mine.local_key());
        assert!(second.promotions.is_empty());
        apply(&mut local, &second);

        assert_eq!(local.len(), 1);
        assert_eq!(local[0].remote_key(), Some(&RemoteKey::new("r1")));
        assert_eq!(local[0].local_key(), mine.local_key());
        assert!(plan(&local, &[listed], Scope::Snapshot).is_empty());
    }

    #[test]
    fn replaying_a_snapshot_is_idempotent() {
        let mine = pending("hi", 5);
        let snapshot = vec![remote("r1", "a", 0), confirm(&mine, "r2"), remote("r3", "c", 9)];
        let mut local = vec![remote("gone", "x", 1), mine];

        let first = plan(&local, &snapshot, Scope::Snapshot);
        assert!(!first.is_empty());
        apply(&mut local, &first);
        let after_first = local.clone();

        let second = plan(&local, &snapshot, Scope::Snapshot);
        assert!(second.is_empty(), "replay must not write: {second:?}");
        apply(&mut local, &second);
        assert_eq!(local, after_first);
        assert_eq!(local.len(), 3);
    }

    #[test]
    fn pending_records_survive_snapshots_that_omit_them() {
        let mine = pending("unsent", 5);
        let confirmed = remote("r1", "a", 0);

        let changes = plan(&[mine, confirmed.clone()], &[], Scope::Snapshot);
        assert_eq!(changes.deletions, vec![confirmed]);
    }

    #[test]
    fn upsert_scope_never_deletes() {
        let changes = plan(&[remote("r1", "a", 0)], &[remote("r2", "b", 1)], Scope::Upsert);
        assert!(changes.deletions.is_empty());
        assert_eq!(changes.inserts.len(), 1);
    }

    #[test]
    fn duplicate_keys_collapse_to_last_occurrence() {
        let changes = plan(
            &[],
            &[remote("r1", "first", 0), remote("r1", "second", 0)],
            Scope::Snapshot,
        );
        assert_eq!(changes.inserts.len(), 1);
        assert_eq!(changes.inserts[0].content, "second");
    }

    #[test]
    fn a_pending_record_is_promoted_at_most_once() {
        let mine = pending("hi", 5);
        let changes = plan(
            &[mine.clone()],
            &[confirm(&mine, "r1"), confirm(&mine, "r2")],
            Scope::Upsert,
        );
        assert_eq!(changes.promotions.len(), 1);
        assert_eq!(changes.inserts.len(), 1);
    }

    #[test]
    fn records_without_remote_key_are_ignored() {
        let changes = plan(&[], &[pending("stray", 0)], Scope::Snapshot);
        assert!(changes.is_empty());
    }

    fn conversation(key: &str, last: Option<i64>, pending: bool) -> Conversation {
        Conversation {
            key: ConversationKey::new(key),
            kind: ConversationKind::Group,
            participant_ids: [UserId::new("me"), UserId::new("bob")].into_iter().collect(),
            title: None,
            avatar_ref: None,
            last_message_preview: last.map(|s| format!("at {s}")),
            last_message_at: last.map(at),
            pending,
        }
    }

    #[test]
    fn pending_conversations_are_protected_and_confirmed_by_key() {
        let pending_local = conversation("direct:bob:me", None, true);
        let stale = conversation("old", None, false);

        let changes = plan(
            &[pending_local.clone(), stale.clone()],
            &[],
            Scope::Snapshot,
        );
        assert_eq!(changes.deletions, vec![stale]);

        let mut confirmed = pending_local.clone();
        confirmed.pending = false;
        let changes = plan(&[pending_local], &[confirmed.clone()], Scope::Snapshot);
        assert_eq!(changes.updates, vec![confirmed]);
    }

    #[test]
    fn conversation_keeps_newer_local_summary() {
        let local = conversation("g", Some(50), false);
        let incoming = conversation("g", Some(10), false);

        let merged = local.absorb(&incoming);
        assert_eq!(merged.last_message_at, Some(at(50)));
        assert_eq!(merged.last_message_preview.as_deref(), Some("at 50"));

        let changes = plan(&[local], &[incoming], Scope::Snapshot);
        assert!(changes.is_empty());
    }
}
