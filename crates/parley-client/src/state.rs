//! Client state shared by the host.
//!
//! [`ClientState`] owns the local store of the signed-in user and builds the
//! sync engines on top of it. Both engines of one client share the same
//! store handle.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use parley_shared::UserId;
use parley_store::Database;
use parley_sync::{
    ConversationSyncEngine, MessageServices, MessageSyncEngine, RemoteConversationChannel,
    SharedDatabase,
};

use crate::config::ClientConfig;

/// Central client state.
pub struct ClientState {
    pub config: ClientConfig,

    /// The signed-in user.
    user: UserId,

    /// Local store, shared with every engine built from this state.
    store: SharedDatabase,
}

impl ClientState {
    /// Open the store of the configured user, creating it on first use.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let user = config
            .user_id
            .clone()
            .context("No signed-in user (set PARLEY_USER_ID)")?;

        let db = match &config.db_path {
            Some(path) => Database::open_at(path)
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
            None => Database::new(&user).context("Failed to open store in the data directory")?,
        };
        info!(user = %user, path = ?db.path(), "Opened local store");

        Ok(Self {
            config,
            user,
            store: parley_sync::share(db),
        })
    }

    /// A throwaway client backed by an in-memory store.
    pub fn in_memory(user: UserId, config: ClientConfig) -> Result<Self> {
        let db = Database::open_in_memory().context("Failed to open in-memory store")?;
        Ok(Self {
            config,
            user,
            store: parley_sync::share(db),
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn store(&self) -> SharedDatabase {
        Arc::clone(&self.store)
    }

    pub fn conversation_engine(
        &self,
        channel: Arc<dyn RemoteConversationChannel>,
    ) -> ConversationSyncEngine {
        ConversationSyncEngine::new(self.user.clone(), self.store(), channel)
    }

    pub fn message_engine(&self, services: MessageServices) -> MessageSyncEngine {
        MessageSyncEngine::new(
            self.user.clone(),
            self.store(),
            services,
            self.config.sync.clone(),
        )
    }
}
