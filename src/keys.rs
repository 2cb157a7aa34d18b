//! KV key namespace shared by the store, the session layer, and sync.
//!
//! Session-scoped entries live under integer-suffixed prefixes; everything
//! else is a flat scalar setting key.

/// Prefix for per-session configuration entries.
pub const SESSION_CONFIG_PREFIX: &str = "session-config:";

/// Prefix for per-session chat history entries.
pub const CHAT_HISTORY_PREFIX: &str = "chat-history:";

/// Pinned reference materials shown in every session.
pub const PINNED_MATERIALS: &str = "pinned-materials";

/// Models the user is allowed to select.
pub const ALLOWED_MODELS: &str = "allowed-models";

/// Shared secret for the snapshot sync endpoint.
pub const SYNC_KEY: &str = "sync-key";

/// Last server version seen, used for upgrade prompts.
pub const LAST_SERVER_VERSION: &str = "last-server-version";

pub fn session_config(session_id: u64) -> String {
    format!("{SESSION_CONFIG_PREFIX}{session_id}")
}

pub fn chat_history(session_id: u64) -> String {
    format!("{CHAT_HISTORY_PREFIX}{session_id}")
}

pub fn parse_session_config(key: &str) -> Option<u64> {
    key.strip_prefix(SESSION_CONFIG_PREFIX)
        .and_then(|id| id.parse().ok())
}

pub fn parse_chat_history(key: &str) -> Option<u64> {
    key.strip_prefix(CHAT_HISTORY_PREFIX)
        .and_then(|id| id.parse().ok())
}

/// Change-bus topic for a mutated key.
///
/// A closed set instead of raw prefix matching, so subscribers cannot
/// collide on overlapping prefixes. `Setting` is the catch-all for every
/// key outside the two session-scoped namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SessionConfig,
    ChatHistory,
    Setting,
}

impl Topic {
    pub fn for_key(key: &str) -> Topic {
        if key.starts_with(SESSION_CONFIG_PREFIX) {
            Topic::SessionConfig
        } else if key.starts_with(CHAT_HISTORY_PREFIX) {
            Topic::ChatHistory
        } else {
            Topic::Setting
        }
    }
}
