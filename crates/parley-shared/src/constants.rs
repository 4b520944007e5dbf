/// Application name
pub const APP_NAME: &str = "Parley";

/// Inactivity window after which a local "typing" broadcast is retracted.
pub const TYPING_TIMEOUT_SECS: u64 = 5;

/// Remote typing statuses older than this are treated as "not typing".
pub const TYPING_STALE_SECS: u64 = 10;

/// Prefix of deterministic direct-conversation keys.
pub const DIRECT_KEY_PREFIX: &str = "direct";

/// Preview shown in a conversation summary for an image message.
pub const IMAGE_PREVIEW: &str = "📷 Photo";

/// Maximum length (in characters) of a conversation summary preview.
pub const MAX_PREVIEW_CHARS: usize = 120;
