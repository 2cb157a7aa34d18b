//! The chat domain schema and the high-level session manager.
//!
//! Sessions are numbered conversations; each one stores a config document
//! and an ordered chat history array in the KV engine. A human message and
//! the AI response to it share one [`ChatId`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::ChatVaultError;
use crate::guard::LoadGuard;
use crate::keys;
use crate::store::KvStore;

/// Identifier for one chat exchange, carrying its creation time so two
/// histories can be interleaved chronologically without a central
/// sequence.
///
/// The string form is `chat-<creation millis>-<salt>`. Entries that
/// predate the scheme (or arrive malformed) become `Legacy` and are
/// preserved but excluded from ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChatId {
    Ordered { created_at: i64, salt: String },
    Legacy(String),
}

impl ChatId {
    /// A fresh identifier stamped with the current wall clock.
    pub fn new() -> Self {
        Self::Ordered {
            created_at: Utc::now().timestamp_millis(),
            salt: Uuid::new_v4().simple().to_string()[..6].to_string(),
        }
    }

    pub fn at(created_at: i64, salt: impl Into<String>) -> Self {
        Self::Ordered {
            created_at,
            salt: salt.into(),
        }
    }

    pub fn parse(s: &str) -> Self {
        let Some(rest) = s.strip_prefix("chat-") else {
            return Self::Legacy(s.to_string());
        };
        let Some((num, salt)) = rest.split_once('-') else {
            return Self::Legacy(s.to_string());
        };
        if num.is_empty() || salt.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
            return Self::Legacy(s.to_string());
        }
        match num.parse::<i64>() {
            Ok(created_at) => Self::Ordered {
                created_at,
                salt: salt.to_string(),
            },
            Err(_) => Self::Legacy(s.to_string()),
        }
    }

    /// Creation time in epoch millis; `None` for legacy identifiers.
    pub fn created_at(&self) -> Option<i64> {
        match self {
            Self::Ordered { created_at, .. } => Some(*created_at),
            Self::Legacy(_) => None,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Ordered { .. })
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ordered { created_at, salt } => write!(f, "chat-{created_at}-{salt}"),
            Self::Legacy(s) => f.write_str(s),
        }
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<ChatId> for String {
    fn from(id: ChatId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Human,
    Ai,
    System,
}

/// One message within a session's history array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatItem {
    pub chat_id: ChatId,
    pub role: ChatRole,
    /// Rendered content shown in the UI.
    pub content: String,
    /// Pre-render content, when it differs from `content`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ChatItem {
    /// A human message opening a new exchange.
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            chat_id: ChatId::new(),
            role: ChatRole::Human,
            content: content.into(),
            raw_content: None,
            html: None,
            model: None,
            cost: None,
        }
    }

    /// The AI response to an exchange; shares the human message's id.
    pub fn reply(to: &ChatId, content: impl Into<String>) -> Self {
        Self {
            chat_id: to.clone(),
            role: ChatRole::Ai,
            content: content.into(),
            raw_content: None,
            html: None,
            model: None,
            cost: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            chat_id: ChatId::new(),
            role: ChatRole::System,
            content: content.into(),
            raw_content: None,
            html: None,
            model: None,
            cost: None,
        }
    }
}

/// Per-session configuration. Credential material is zeroizable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Zeroize)]
pub struct SessionConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub system_prompt: String,
    pub session_name: String,
    /// Let the assistant fetch web pages for context.
    pub web_access: bool,
    /// Route requests through the all-in-one model selector.
    pub auto_route: bool,
    pub hidden: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            system_prompt: String::new(),
            session_name: "New Chat".to_string(),
            web_access: false,
            auto_route: false,
            hidden: false,
        }
    }
}

/// High-level session operations over the KV engine.
///
/// Every successful session-scoped write bumps the mutation version on the
/// shared [`LoadGuard`] so in-flight history loads can detect staleness.
#[derive(Clone)]
pub struct SessionStore {
    kv: KvStore,
    guard: Arc<LoadGuard>,
}

impl SessionStore {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            guard: Arc::new(LoadGuard::new()),
        }
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn guard(&self) -> &LoadGuard {
        &self.guard
    }

    /// Allocate the next free session id and persist a default config plus
    /// an empty history. Both writes are required, so failures propagate.
    pub async fn create_session(&self, name: &str) -> crate::Result<u64> {
        let session_id = self.session_ids().await?.last().map_or(1, |id| id + 1);
        let config = SessionConfig {
            session_name: name.to_string(),
            ..SessionConfig::default()
        };
        self.kv
            .set(&keys::session_config(session_id), serde_json::to_value(&config)?)
            .await?;
        self.kv
            .set(&keys::chat_history(session_id), Value::Array(Vec::new()))
            .await?;
        self.guard.mark_mutation();
        Ok(session_id)
    }

    /// Ids of all live sessions, sorted.
    pub async fn session_ids(&self) -> crate::Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .kv
            .list()
            .await?
            .iter()
            .filter_map(|key| keys::parse_session_config(key))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Config for `session_id`. A session with no stored config uses a
    /// synthesized default, which is not written back until saved.
    pub async fn config(&self, session_id: u64) -> crate::Result<SessionConfig> {
        match self.kv.get(&keys::session_config(session_id)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(SessionConfig::default()),
        }
    }

    pub async fn save_config(&self, session_id: u64, config: &SessionConfig) -> crate::Result<()> {
        self.kv
            .set(&keys::session_config(session_id), serde_json::to_value(config)?)
            .await?;
        self.guard.mark_mutation();
        Ok(())
    }

    pub async fn rename_session(&self, session_id: u64, name: &str) -> crate::Result<()> {
        if !self.kv.exists(&keys::session_config(session_id)).await? {
            return Err(ChatVaultError::SessionNotFound(session_id));
        }
        let mut config = self.config(session_id).await?;
        config.session_name = name.to_string();
        self.save_config(session_id, &config).await
    }

    pub async fn delete_session(&self, session_id: u64) -> crate::Result<()> {
        self.kv.delete(&keys::session_config(session_id)).await?;
        self.kv.delete(&keys::chat_history(session_id)).await?;
        self.guard.mark_mutation();
        Ok(())
    }

    pub async fn history(&self, session_id: u64) -> crate::Result<Vec<ChatItem>> {
        match self.kv.get(&keys::chat_history(session_id)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append one chat item to the session's history.
    ///
    /// This write is required before the caller may continue (a new chat
    /// must persist before a response streams), so failures propagate
    /// instead of being logged away.
    pub async fn append_chat(&self, session_id: u64, item: ChatItem) -> crate::Result<()> {
        let mut history = self.history(session_id).await?;
        history.push(item);
        self.kv
            .set(&keys::chat_history(session_id), serde_json::to_value(&history)?)
            .await?;
        self.guard.mark_mutation();
        Ok(())
    }

    /// Replace the session's history with an empty array.
    pub async fn clear_history(&self, session_id: u64) -> crate::Result<()> {
        self.kv
            .set(&keys::chat_history(session_id), Value::Array(Vec::new()))
            .await?;
        self.guard.mark_mutation();
        Ok(())
    }

    pub async fn pinned_materials(&self) -> crate::Result<Option<String>> {
        self.get_string(keys::PINNED_MATERIALS).await
    }

    pub async fn set_pinned_materials(&self, text: &str) -> crate::Result<()> {
        self.kv.set(keys::PINNED_MATERIALS, Value::String(text.to_string())).await
    }

    pub async fn allowed_models(&self) -> crate::Result<Vec<String>> {
        match self.kv.get(keys::ALLOWED_MODELS).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_allowed_models(&self, models: &[String]) -> crate::Result<()> {
        self.kv
            .set(keys::ALLOWED_MODELS, serde_json::to_value(models)?)
            .await
    }

    pub async fn sync_key(&self) -> crate::Result<Option<String>> {
        self.get_string(keys::SYNC_KEY).await
    }

    pub async fn set_sync_key(&self, key: &str) -> crate::Result<()> {
        self.kv.set(keys::SYNC_KEY, Value::String(key.to_string())).await
    }

    pub async fn last_server_version(&self) -> crate::Result<Option<String>> {
        self.get_string(keys::LAST_SERVER_VERSION).await
    }

    pub async fn set_last_server_version(&self, version: &str) -> crate::Result<()> {
        self.kv
            .set(keys::LAST_SERVER_VERSION, Value::String(version.to_string()))
            .await
    }

    /// The full local key→value map, as pushed to the sync endpoint.
    pub async fn export_snapshot(&self) -> crate::Result<BTreeMap<String, Value>> {
        let mut snapshot = BTreeMap::new();
        for key in self.kv.list().await? {
            if let Some(value) = self.kv.get(&key).await? {
                snapshot.insert(key, value);
            }
        }
        Ok(snapshot)
    }

    /// Reconcile a pulled remote snapshot into the local store. Returns
    /// the number of keys whose local value changed.
    pub async fn apply_remote_snapshot(
        &self,
        snapshot: &BTreeMap<String, Value>,
    ) -> crate::Result<usize> {
        let applied = crate::sync::apply_snapshot(&self.kv, snapshot).await?;
        if applied > 0 {
            self.guard.mark_mutation();
        }
        Ok(applied)
    }

    async fn get_string(&self, key: &str) -> crate::Result<Option<String>> {
        match self.kv.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_id_parse_ordered() {
        let id = ChatId::parse("chat-1000-abc");
        assert_eq!(id, ChatId::at(1000, "abc"));
        assert_eq!(id.created_at(), Some(1000));
        assert_eq!(id.to_string(), "chat-1000-abc");
    }

    #[test]
    fn test_chat_id_parse_legacy_forms() {
        for s in ["msg-17", "chat-", "chat-abc-def", "chat-1000-", "chat-1000", ""] {
            let id = ChatId::parse(s);
            assert!(!id.is_ordered(), "{s:?} should be legacy");
            assert_eq!(id.created_at(), None);
            assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn test_chat_id_serde_as_string() {
        let item = ChatItem::reply(&ChatId::at(1000, "abc"), "hello");
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["chat_id"], json!("chat-1000-abc"));
        assert_eq!(value["role"], json!("ai"));
        let back: ChatItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_chat_item_optional_fields_default() {
        let item: ChatItem = serde_json::from_value(json!({
            "chat_id": "chat-1000-abc",
            "role": "human",
            "content": "hi",
        }))
        .unwrap();
        assert_eq!(item.raw_content, None);
        assert_eq!(item.model, None);
        assert_eq!(item.cost, None);
    }

    #[tokio::test]
    async fn test_create_session_allocates_sequential_ids() {
        let store = SessionStore::new(KvStore::open_in_memory());
        assert_eq!(store.create_session("first").await.unwrap(), 1);
        assert_eq!(store.create_session("second").await.unwrap(), 2);
        assert_eq!(store.session_ids().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_config_synthesized_when_absent() {
        let store = SessionStore::new(KvStore::open_in_memory());
        let config = store.config(42).await.unwrap();
        assert_eq!(config, SessionConfig::default());
        // The synthesized default is not written back.
        assert!(!store.kv().exists("session-config:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_session() {
        let store = SessionStore::new(KvStore::open_in_memory());
        let id = store.create_session("Work").await.unwrap();
        store.rename_session(id, "Personal").await.unwrap();
        assert_eq!(store.config(id).await.unwrap().session_name, "Personal");

        let err = store.rename_session(99, "nope").await.unwrap_err();
        assert!(matches!(err, ChatVaultError::SessionNotFound(99)));
    }

    #[tokio::test]
    async fn test_delete_session_removes_both_entries() {
        let store = SessionStore::new(KvStore::open_in_memory());
        let id = store.create_session("doomed").await.unwrap();
        store
            .append_chat(id, ChatItem::human("hello"))
            .await
            .unwrap();
        store.delete_session(id).await.unwrap();
        assert!(store.session_ids().await.unwrap().is_empty());
        assert!(store.history(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_history_replaces_wholesale() {
        let store = SessionStore::new(KvStore::open_in_memory());
        let id = store.create_session("chatty").await.unwrap();
        store.append_chat(id, ChatItem::human("one")).await.unwrap();
        store.append_chat(id, ChatItem::human("two")).await.unwrap();
        store.clear_history(id).await.unwrap();
        assert!(store.history(id).await.unwrap().is_empty());
        // The entry itself survives as an empty array.
        assert!(store.kv().exists(&keys::chat_history(id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_writes_bump_mutation_version() {
        let store = SessionStore::new(KvStore::open_in_memory());
        let id = store.create_session("busy").await.unwrap();
        let ticket = store.guard().begin_load(id);
        store.append_chat(id, ChatItem::human("hi")).await.unwrap();
        assert!(store.guard().is_stale(&ticket, id));
    }

    #[tokio::test]
    async fn test_scalar_settings_roundtrip() {
        let store = SessionStore::new(KvStore::open_in_memory());
        assert_eq!(store.sync_key().await.unwrap(), None);
        store.set_sync_key("secret").await.unwrap();
        assert_eq!(store.sync_key().await.unwrap(), Some("secret".to_string()));

        let models = vec!["gpt-4".to_string(), "claude-3".to_string()];
        store.set_allowed_models(&models).await.unwrap();
        assert_eq!(store.allowed_models().await.unwrap(), models);

        store.set_pinned_materials("style guide").await.unwrap();
        store.set_last_server_version("2.3.1").await.unwrap();
        assert_eq!(
            store.last_server_version().await.unwrap(),
            Some("2.3.1".to_string())
        );
    }
}
