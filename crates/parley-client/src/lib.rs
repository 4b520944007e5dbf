//! Host-facing entry point of the Parley sync core.
//!
//! A host (desktop shell, mobile bridge, test harness) calls [`init_logging`]
//! once, builds a [`ClientConfig`], opens a [`ClientState`] and asks it for
//! the sync engines of the signed-in user.

pub mod config;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use state::ClientState;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "parley_client=debug,parley_sync=debug,parley_store=info,warn";

/// Install the global tracing subscriber. Calling it again is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            "Starting {} sync core",
            parley_shared::constants::APP_NAME
        );
    }
}
