//! Engine timings.

use std::time::Duration;

use parley_shared::constants::{TYPING_STALE_SECS, TYPING_TIMEOUT_SECS};

/// Tunables shared by the sync engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Inactivity after which the local "typing" broadcast is retracted.
    pub typing_timeout: Duration,

    /// Remote typing statuses older than this are ignored.
    pub typing_stale_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_secs(TYPING_TIMEOUT_SECS),
            typing_stale_after: Duration::from_secs(TYPING_STALE_SECS),
        }
    }
}
