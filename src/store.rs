//! The key-value engine: an embedded, revisioned document store.
//!
//! Values are arbitrary JSON documents. Every stored document carries an
//! engine-assigned [`Revision`]; overwrites read the current revision and
//! write with it attached, so concurrent writers on the same key are
//! detected instead of silently interleaving. The handle is explicitly
//! constructed and shared by cloning; there is no module-level singleton.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChatVaultError;
use crate::events::{ChangeBus, ChangeEvent, ChangeKind};

/// Bounded re-read-and-retry on revision conflicts before the write is
/// abandoned with [`ChatVaultError::WriteConflict`].
const CONFLICT_RETRIES: usize = 3;

/// Bounded retry for operations that observe the handle mid-teardown.
const TEARDOWN_RETRIES: usize = 3;
const TEARDOWN_BACKOFF_MS: u64 = 25;

/// Opaque revision token identifying one version of a key's value.
///
/// Internally `<sequence>-<salt>`; callers must treat it as opaque and only
/// pass it back to [`KvStore::put_with_rev`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    fn first() -> Self {
        Self(format!("1-{}", rev_salt()))
    }

    fn next(&self) -> Self {
        let seq = self
            .0
            .split_once('-')
            .and_then(|(seq, _)| seq.parse::<u64>().ok())
            .unwrap_or(0);
        Self(format!("{}-{}", seq + 1, rev_salt()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn rev_salt() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    value: Value,
    rev: Revision,
}

struct EngineState {
    docs: HashMap<String, Document>,
    open: bool,
}

/// Handle to the embedded store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct KvStore {
    state: Arc<RwLock<EngineState>>,
    bus: ChangeBus,
    persistence_path: Option<PathBuf>,
}

impl KvStore {
    /// A store that lives only in memory.
    pub fn open_in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState {
                docs: HashMap::new(),
                open: true,
            })),
            bus: ChangeBus::new(),
            persistence_path: None,
        }
    }

    /// Open a store backed by a JSON file. An existing file is loaded into
    /// memory; every successful mutation is written back best-effort.
    pub async fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let mut docs = HashMap::new();
        if path.exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ChatVaultError::FileSystem(e.to_string()))?;
            docs = serde_json::from_str(&data)?;
        }
        Ok(Self {
            state: Arc::new(RwLock::new(EngineState { docs, open: true })),
            bus: ChangeBus::new(),
            persistence_path: Some(path),
        })
    }

    /// The change bus this store dispatches on.
    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub async fn get(&self, key: &str) -> crate::Result<Option<Value>> {
        self.with_read(|state| Ok(state.docs.get(key).map(|doc| doc.value.clone())))
            .await
    }

    pub async fn exists(&self, key: &str) -> crate::Result<bool> {
        self.with_read(|state| Ok(state.docs.contains_key(key)))
            .await
    }

    /// Current revision of `key`, `None` for a key never written.
    pub async fn revision(&self, key: &str) -> crate::Result<Option<Revision>> {
        self.with_read(|state| Ok(state.docs.get(key).map(|doc| doc.rev.clone())))
            .await
    }

    /// All keys currently stored, sorted.
    pub async fn list(&self) -> crate::Result<Vec<String>> {
        self.with_read(|state| {
            let mut keys: Vec<String> = state.docs.keys().cloned().collect();
            keys.sort();
            Ok(keys)
        })
        .await
    }

    /// Write `value` under `key`, overwriting any current value.
    ///
    /// Reads the key's current revision and writes with it attached. A
    /// concurrent rewrite between the read and the write is re-read and
    /// retried a bounded number of times; if the conflict persists the
    /// write is abandoned and surfaced as
    /// [`ChatVaultError::WriteConflict`].
    pub async fn set(&self, key: &str, value: Value) -> crate::Result<()> {
        let mut attempt = 0;
        loop {
            let expected = self.revision(key).await?;
            match self.put_with_rev(key, value.clone(), expected).await {
                Err(ChatVaultError::WriteConflict(_)) if attempt + 1 < CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(key, attempt, "revision conflict, re-reading and retrying");
                }
                Err(ChatVaultError::WriteConflict(key)) => {
                    tracing::warn!(key = %key, "revision conflict persisted after retries, write dropped");
                    return Err(ChatVaultError::WriteConflict(key));
                }
                other => return other,
            }
        }
    }

    /// Conflict-safe write primitive: succeeds only when the key's current
    /// revision still equals `expected` (`None` for a key never written).
    pub async fn put_with_rev(
        &self,
        key: &str,
        value: Value,
        expected: Option<Revision>,
    ) -> crate::Result<()> {
        let old_value = self
            .with_write(|state| {
                let current = state.docs.get(key).map(|doc| doc.rev.clone());
                if current != expected {
                    return Err(ChatVaultError::WriteConflict(key.to_string()));
                }
                let rev = match &current {
                    Some(rev) => rev.next(),
                    None => Revision::first(),
                };
                let old = state
                    .docs
                    .insert(
                        key.to_string(),
                        Document {
                            value: value.clone(),
                            rev,
                        },
                    )
                    .map(|doc| doc.value);
                Ok(old)
            })
            .await?;

        self.persist_best_effort();
        self.bus.dispatch(&ChangeEvent {
            key: key.to_string(),
            kind: ChangeKind::Set,
            old_value,
            new_value: Some(value),
        });
        Ok(())
    }

    /// Remove `key` and its revision history. No-op for a missing key.
    pub async fn delete(&self, key: &str) -> crate::Result<()> {
        let removed = self
            .with_write(|state| Ok(state.docs.remove(key).map(|doc| doc.value)))
            .await?;
        if let Some(old_value) = removed {
            self.persist_best_effort();
            self.bus.dispatch(&ChangeEvent {
                key: key.to_string(),
                kind: ChangeKind::Del,
                old_value: Some(old_value),
                new_value: None,
            });
        }
        Ok(())
    }

    /// Move a value to a new key. Read-old, write-new, delete-old; not
    /// atomic, so an interruption between steps can leave the value under
    /// both keys.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> crate::Result<()> {
        let Some(value) = self.get(old_key).await? else {
            return Ok(());
        };
        self.set(new_key, value).await?;
        self.delete(old_key).await
    }

    /// Destroy and reconstruct the store. Listeners are notified of a
    /// deletion for every previously known key before the data goes away.
    pub async fn clear(&self) -> crate::Result<()> {
        let mut entries: Vec<(String, Value)> = self
            .with_read(|state| {
                Ok(state
                    .docs
                    .iter()
                    .map(|(key, doc)| (key.clone(), doc.value.clone()))
                    .collect())
            })
            .await?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in entries {
            self.bus.dispatch(&ChangeEvent {
                key,
                kind: ChangeKind::Del,
                old_value: Some(value),
                new_value: None,
            });
        }
        self.with_write(|state| {
            state.docs = HashMap::new();
            Ok(())
        })
        .await?;
        self.persist_best_effort();
        Ok(())
    }

    /// Explicitly write the current state to the backing file, if any.
    pub async fn flush(&self) -> crate::Result<()> {
        if let Some(path) = self.persistence_path.clone() {
            self.save_to(&path)?;
        }
        Ok(())
    }

    /// Flush and mark the handle torn down.
    ///
    /// A later operation on the same handle observes the teardown and
    /// reopens via the retry path; `close` is meant for shutdown, after
    /// which the handle is dropped.
    pub async fn close(&self) -> crate::Result<()> {
        self.flush().await?;
        let mut state = self
            .state
            .write()
            .map_err(|e| ChatVaultError::Storage(e.to_string()))?;
        state.open = false;
        Ok(())
    }

    async fn with_read<F, R>(&self, mut f: F) -> crate::Result<R>
    where
        F: FnMut(&EngineState) -> crate::Result<R>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let state = self
                    .state
                    .read()
                    .map_err(|e| ChatVaultError::Storage(e.to_string()))?;
                if state.open {
                    f(&state)
                } else {
                    Err(ChatVaultError::Closed("store handle torn down".to_string()))
                }
            };
            match result {
                Err(ChatVaultError::Closed(_)) if attempt < TEARDOWN_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(TEARDOWN_BACKOFF_MS)).await;
                    self.reinit()?;
                }
                other => return other,
            }
        }
    }

    async fn with_write<F, R>(&self, mut f: F) -> crate::Result<R>
    where
        F: FnMut(&mut EngineState) -> crate::Result<R>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let mut state = self
                    .state
                    .write()
                    .map_err(|e| ChatVaultError::Storage(e.to_string()))?;
                if state.open {
                    f(&mut state)
                } else {
                    Err(ChatVaultError::Closed("store handle torn down".to_string()))
                }
            };
            match result {
                Err(ChatVaultError::Closed(_)) if attempt < TEARDOWN_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(TEARDOWN_BACKOFF_MS)).await;
                    self.reinit()?;
                }
                other => return other,
            }
        }
    }

    /// Re-open a handle that observed mid-teardown state. Reloads the
    /// backing file best-effort when the in-memory map is empty.
    fn reinit(&self) -> crate::Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| ChatVaultError::Storage(e.to_string()))?;
        if state.open {
            return Ok(());
        }
        if state.docs.is_empty() {
            if let Some(path) = &self.persistence_path {
                if path.exists() {
                    if let Ok(data) = std::fs::read_to_string(path) {
                        if let Ok(docs) = serde_json::from_str(&data) {
                            state.docs = docs;
                        }
                    }
                }
            }
        }
        state.open = true;
        Ok(())
    }

    fn persist_best_effort(&self) {
        if let Some(path) = &self.persistence_path {
            if let Err(err) = self.save_to(path) {
                tracing::warn!(error = %err, "failed to persist store state");
            }
        }
    }

    fn save_to(&self, path: &Path) -> crate::Result<()> {
        let docs = {
            let state = self
                .state
                .read()
                .map_err(|e| ChatVaultError::Storage(e.to_string()))?;
            state.docs.clone()
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChatVaultError::FileSystem(e.to_string()))?;
        }
        let data = serde_json::to_string_pretty(&docs)?;
        Self::atomic_write(path, data.as_bytes())
    }

    // Write to a temporary file in the same directory and rename into
    // place. Rename over an existing file may not be atomic across
    // filesystems; avoid sharing the backing file across mounts.
    fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| ChatVaultError::FileSystem("Invalid path".to_string()))?;
        use rand::{thread_rng, Rng};
        let suffix: u64 = thread_rng().gen();
        let tmp = parent.join(format!(".tmp_chatvault.{suffix}"));
        std::fs::write(&tmp, bytes).map_err(|e| ChatVaultError::FileSystem(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| ChatVaultError::FileSystem(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeKind;
    use crate::keys::Topic;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_missing_key_reads() {
        let store = KvStore::open_in_memory();
        tokio_test::block_on(async {
            assert_eq!(store.get("never-written").await.unwrap(), None);
            assert!(!store.exists("never-written").await.unwrap());
            assert_eq!(store.revision("never-written").await.unwrap(), None);
        });
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = KvStore::open_in_memory();
        let value = json!({
            "session_name": "Work",
            "temperature": 0.7,
            "tags": ["a", "b"],
        });
        store.set("session-config:1", value.clone()).await.unwrap();
        assert_eq!(store.get("session-config:1").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let store = KvStore::open_in_memory();
        store.set("k", json!(1)).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        // Deleting a missing key is a no-op, not an error.
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_revision_advances_on_rewrite() {
        let store = KvStore::open_in_memory();
        store.set("k", json!(1)).await.unwrap();
        let first = store.revision("k").await.unwrap().unwrap();
        store.set("k", json!(2)).await.unwrap();
        let second = store.revision("k").await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_put_with_stale_revision_conflicts() {
        let store = KvStore::open_in_memory();
        store.set("k", json!(1)).await.unwrap();
        let stale = store.revision("k").await.unwrap();
        store.set("k", json!(2)).await.unwrap();

        let err = store.put_with_rev("k", json!(3), stale).await.unwrap_err();
        assert!(matches!(err, ChatVaultError::WriteConflict(_)));
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = KvStore::open_in_memory();
        store.set("b", json!(1)).await.unwrap();
        store.set("a", json!(2)).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rename_moves_value() {
        let store = KvStore::open_in_memory();
        store.set("old", json!("v")).await.unwrap();
        store.rename("old", "new").await.unwrap();
        assert_eq!(store.get("old").await.unwrap(), None);
        assert_eq!(store.get("new").await.unwrap(), Some(json!("v")));

        // Renaming a missing key is a no-op.
        store.rename("gone", "elsewhere").await.unwrap();
        assert_eq!(store.get("elsewhere").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_dispatches_exactly_once() {
        let store = KvStore::open_in_memory();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        store.bus().add_listener(Topic::Setting, None, move |event| {
            assert_eq!(event.kind, ChangeKind::Set);
            assert_eq!(event.new_value, Some(json!("v")));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        store.set("sync-key", json!("v")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A session-config write lands on a different topic.
        store.set("session-config:1", json!({})).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_notifies_every_key() {
        let store = KvStore::open_in_memory();
        store.set("alpha", json!(1)).await.unwrap();
        store.set("beta", json!(2)).await.unwrap();

        let deleted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = deleted.clone();
        store.bus().add_listener(Topic::Setting, None, move |event| {
            if event.kind == ChangeKind::Del {
                sink.lock().unwrap().push(event.key.clone());
            }
            Ok(())
        });

        store.clear().await.unwrap();
        assert_eq!(*deleted.lock().unwrap(), vec!["alpha", "beta"]);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let tmp_dir = TempDir::new().unwrap();
        let state_file = tmp_dir.path().join("state.json");

        let store = KvStore::open(&state_file).await.unwrap();
        store.set("session-config:1", json!({"session_name": "Work"})).await.unwrap();
        store.set("sync-key", json!("secret")).await.unwrap();
        store.flush().await.unwrap();
        drop(store);

        let store = KvStore::open(&state_file).await.unwrap();
        assert_eq!(
            store.get("session-config:1").await.unwrap(),
            Some(json!({"session_name": "Work"}))
        );
        assert_eq!(store.get("sync-key").await.unwrap(), Some(json!("secret")));
    }

    #[tokio::test]
    async fn test_closed_handle_reopens_via_retry() {
        let store = KvStore::open_in_memory();
        store.set("k", json!(1)).await.unwrap();
        store.close().await.unwrap();

        // The retry path reinitializes the handle instead of failing.
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
    }
}
