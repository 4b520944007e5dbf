//! # parley-shared
//!
//! Types shared by every Parley crate: identifier newtypes, the closed
//! enumerations that describe conversations and messages, the ephemeral
//! presence/typing records pushed by the low-latency channel, and the error
//! type remote collaborators report failures with.

pub mod constants;
pub mod error;
pub mod presence;
pub mod types;

pub use error::ChannelError;
pub use presence::{PresenceState, TypingStatus};
pub use types::*;
