//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so a host only has to provide the signed-in
//! user.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::UserId;
use parley_sync::SyncConfig;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientConfig {
    /// The signed-in user. Required to open the store.
    /// Env: `PARLEY_USER_ID`
    pub user_id: Option<UserId>,

    /// Database file location.
    /// Env: `PARLEY_DB_PATH`
    /// Default: one file per user under the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Engine timings.
    /// Env: `PARLEY_TYPING_TIMEOUT_SECS`, `PARLEY_TYPING_STALE_SECS`
    /// Defaults: 5 s and 10 s.
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`. Invalid values are logged and
    /// replaced by their default.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(user) = lookup("PARLEY_USER_ID") {
            let user = user.trim();
            if !user.is_empty() {
                config.user_id = Some(UserId::new(user));
            }
        }

        if let Some(path) = lookup("PARLEY_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(secs) = parse_secs(&lookup, "PARLEY_TYPING_TIMEOUT_SECS") {
            config.sync.typing_timeout = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "PARLEY_TYPING_STALE_SECS") {
            config.sync.typing_stale_after = secs;
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(variable = name, value = %value, "Invalid duration, using default");
            None
        }
    }
}
