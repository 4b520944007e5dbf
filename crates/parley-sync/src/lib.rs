//! # parley-sync
//!
//! Synchronization engines that keep the local store in line with the remote
//! backend.
//!
//! - [`reconcile`] -- pure identity reconciliation producing store change sets.
//! - [`channels`] -- capability traits for the remote backend, snapshot sinks
//!   and scoped subscription handles.
//! - [`messages`] -- per-conversation message engine with optimistic sends.
//! - [`conversations`] -- conversation list engine and creation flows.
//! - [`typing`] / [`presence`] -- typing broadcaster and presence text.
//!
//! Engines are single-owner values. Remote pushes and task completions are
//! queued on the engine's inbox and applied by `process_next` / `drain` on the
//! owning task.

use std::sync::{Arc, Mutex};

use parley_store::Database;

pub mod channels;
pub mod config;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod presence;
pub mod reconcile;
pub mod typing;

#[cfg(test)]
mod test_support;

pub use channels::{
    ChannelEvent, ImageUpload, MediaUploader, OutgoingMessage, PresenceChannel,
    RemoteConversationChannel, RemoteMessageChannel, SnapshotSink, Subscription,
};
pub use config::SyncConfig;
pub use conversations::ConversationSyncEngine;
pub use error::SyncError;
pub use messages::{MessageServices, MessageSyncEngine};
pub use presence::PresenceAggregator;
pub use reconcile::{plan, Scope, SyncRecord};
pub use typing::{TypingBroadcaster, TypingState};

/// Store handle shared by the engines of one client.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Wrap a database for sharing between engines.
pub fn share(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Run `f` with the store locked.
pub(crate) fn with_store<T>(
    store: &SharedDatabase,
    f: impl FnOnce(&mut Database) -> parley_store::Result<T>,
) -> Result<T> {
    let mut db = store.lock().map_err(|_| SyncError::StorePoisoned)?;
    Ok(f(&mut db)?)
}
