use thiserror::Error;

use parley_shared::{ChannelError, LocalKey};
use parley_store::StoreError;

/// Errors surfaced by the sync engines.
///
/// The `Display` text is what the UI shows the user.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Local storage is unavailable")]
    StorePoisoned,

    #[error("Could not send message: {0}")]
    Send(ChannelError),

    #[error("Could not upload image: {0}")]
    Upload(ChannelError),

    #[error("Could not create conversation: {0}")]
    Create(ChannelError),

    #[error("Connection lost: {0}")]
    Subscription(ChannelError),

    #[error("Image sending is not available")]
    UploadUnavailable,

    #[error("No conversation is open")]
    NotStarted,

    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("No failed message with local key {0}")]
    UnknownPending(LocalKey),

    #[error("The image for this message is no longer available; pick it again")]
    MediaMissing,
}
