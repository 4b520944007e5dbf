use thiserror::Error;

/// Failure reported by a remote collaborator (message/conversation channel,
/// media uploader, presence channel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Remote service unavailable")]
    Unavailable,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,
}
