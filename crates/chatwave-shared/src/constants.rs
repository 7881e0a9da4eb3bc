/// Minimum length of a user display name (characters)
pub const MIN_USER_NAME_LEN: usize = 2;

/// Maximum length of a user bio (characters)
pub const MAX_BIO_LEN: usize = 160;

/// Minimum length of a group name (characters)
pub const MIN_GROUP_NAME_LEN: usize = 3;

/// Maximum length of a group description (characters)
pub const MAX_DESCRIPTION_LEN: usize = 200;

/// Maximum length of a text message (characters)
pub const MAX_MESSAGE_LEN: usize = 16_384;

/// Base URL of lettered placeholder avatars
pub const PLACEHOLDER_AVATAR_BASE: &str = "https://placehold.co/100x100?text=";

/// Name shown for a referenced user whose record has not arrived yet
pub const UNKNOWN_USER_NAME: &str = "Unknown User";

/// Mime prefix of attachments rendered inline
pub const IMAGE_MIME_PREFIX: &str = "image/";

/// Queued deltas per subscriber before same-entity updates are coalesced
pub const DEFAULT_SUBSCRIBER_SOFT_LIMIT: usize = 256;

/// Queued deltas per subscriber before the subscription is closed as lagging
pub const DEFAULT_SUBSCRIBER_HARD_LIMIT: usize = 4096;
