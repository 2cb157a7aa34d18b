//! HTTP client for the snapshot sync endpoint.
//!
//! The endpoint speaks one flat JSON map from KV key to value, the same
//! namespace the local store uses. Authentication is a shared secret in a
//! request header.

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;

use crate::error::ChatVaultError;
use crate::session::SessionStore;

/// Header carrying the shared sync secret.
pub const SYNC_KEY_HEADER: &str = "x-sync-key";

/// Outcome of one pull-then-push cycle, for the UI notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Keys in the downloaded remote snapshot.
    pub pulled: usize,
    /// Local keys changed by the merge.
    pub merged: usize,
    /// Keys in the uploaded local snapshot.
    pub pushed: usize,
}

#[derive(Debug)]
pub struct SyncEngine {
    client: reqwest::Client,
    endpoint: String,
}

impl SyncEngine {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint from the `CHATVAULT_SYNC_URL` environment variable.
    pub fn from_env() -> crate::Result<Self> {
        let endpoint = std::env::var("CHATVAULT_SYNC_URL").map_err(|_| {
            ChatVaultError::Configuration(
                "CHATVAULT_SYNC_URL environment variable not found".to_string(),
            )
        })?;
        Ok(Self::new(endpoint))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Download the remote snapshot.
    ///
    /// HTTP 400 means no snapshot has been uploaded for this sync key yet
    /// and yields an empty map; any other non-2xx status is a hard
    /// failure.
    pub async fn pull_snapshot(&self, sync_key: &str) -> crate::Result<BTreeMap<String, Value>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .headers(build_headers(sync_key)?)
            .send()
            .await?;
        if resp.status() == StatusCode::BAD_REQUEST {
            return Ok(BTreeMap::new());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ChatVaultError::Sync(format!(
                "snapshot download failed ({status}): {error_text}"
            )));
        }
        Ok(resp.json().await?)
    }

    /// Upload the full local key→value map.
    pub async fn push_snapshot(
        &self,
        sync_key: &str,
        snapshot: &BTreeMap<String, Value>,
    ) -> crate::Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(build_headers(sync_key)?)
            .json(snapshot)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ChatVaultError::Sync(format!(
                "snapshot upload failed ({status}): {error_text}"
            )));
        }
        Ok(())
    }

    /// One pull-then-push reconciliation.
    ///
    /// Aborts on the first failure; per-key merges already applied are not
    /// rolled back.
    pub async fn run_cycle(&self, store: &SessionStore) -> crate::Result<SyncReport> {
        let sync_key = store.sync_key().await?.ok_or_else(|| {
            ChatVaultError::Configuration("sync key not set".to_string())
        })?;
        let remote = self.pull_snapshot(&sync_key).await?;
        tracing::debug!(keys = remote.len(), "pulled remote snapshot");
        let merged = store.apply_remote_snapshot(&remote).await?;
        let local = store.export_snapshot().await?;
        self.push_snapshot(&sync_key, &local).await?;
        tracing::debug!(merged, pushed = local.len(), "sync cycle complete");
        Ok(SyncReport {
            pulled: remote.len(),
            merged,
            pushed: local.len(),
        })
    }
}

fn build_headers(sync_key: &str) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static("chatvault/sync"));
    headers.insert(
        SYNC_KEY_HEADER,
        HeaderValue::from_str(sync_key).map_err(|_| {
            ChatVaultError::Configuration("sync key is not a valid header value".to_string())
        })?,
    );
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env-var tests must not interleave.
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_from_env() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let original = std::env::var("CHATVAULT_SYNC_URL").ok();

        std::env::set_var("CHATVAULT_SYNC_URL", "https://sync.example.com/snapshot");
        let engine = SyncEngine::from_env().unwrap();
        assert_eq!(engine.endpoint(), "https://sync.example.com/snapshot");

        std::env::remove_var("CHATVAULT_SYNC_URL");
        let result = SyncEngine::from_env();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("CHATVAULT_SYNC_URL"));

        if let Some(url) = original {
            std::env::set_var("CHATVAULT_SYNC_URL", url);
        }
    }

    #[test]
    fn test_header_construction() {
        let headers = build_headers("secret-123").unwrap();
        assert_eq!(headers.get(SYNC_KEY_HEADER).unwrap(), "secret-123");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_invalid_sync_key_rejected() {
        let err = build_headers("bad\nkey").unwrap_err();
        assert!(matches!(err, ChatVaultError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_cycle_requires_sync_key() {
        let store = crate::SessionStore::new(crate::KvStore::open_in_memory());
        let engine = SyncEngine::new("http://127.0.0.1:1/snapshot");
        let err = engine.run_cycle(&store).await.unwrap_err();
        assert!(matches!(err, ChatVaultError::Configuration(_)));
    }
}
