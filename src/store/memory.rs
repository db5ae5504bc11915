//! In-process [`SecretStore`] for tests and dry runs.
//!
//! Besides plain insert/get it can make a path fail or stall, which is how
//! the fail-stop and isolation behaviour of the socket servers is exercised.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::{KvSecret, SecretStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    secrets: HashMap<String, KvSecret>,
    failing: HashSet<String>,
    /// Closed (released) semaphores let waiters through.
    gates: HashMap<String, Arc<Semaphore>>,
    fetches: HashMap<String, usize>,
}

/// Thread-safe in-memory secret store. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every other server.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store `data` (a JSON object) at `path`, replacing any previous value.
    ///
    /// Non-object values are stored under a single `value` key.
    pub fn insert(&self, path: &str, data: Value) {
        let map = match data {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.lock()
            .secrets
            .insert(path.to_string(), KvSecret::new(map));
    }

    /// Make every fetch of `path` fail with a 503.
    pub fn fail(&self, path: &str) {
        self.lock().failing.insert(path.to_string());
    }

    /// Make fetches of `path` block until [`MemoryStore::release`].
    pub fn stall(&self, path: &str) {
        self.lock()
            .gates
            .insert(path.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Unblock every fetch waiting on `path`.
    pub fn release(&self, path: &str) {
        if let Some(gate) = self.lock().gates.remove(path) {
            gate.close();
        }
    }

    /// Number of fetches started for `path`, including stalled ones.
    pub fn fetch_count(&self, path: &str) -> usize {
        self.lock().fetches.get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<KvSecret, StoreError> {
        let gate = {
            let mut inner = self.lock();
            *inner.fetches.entry(path.to_string()).or_insert(0) += 1;
            inner.gates.get(path).cloned()
        };

        if let Some(gate) = gate {
            // Never granted a permit; returns once the gate is closed.
            let _ = gate.acquire().await;
        }

        let inner = self.lock();
        if inner.failing.contains(path) {
            return Err(StoreError::Status {
                path: path.to_string(),
                status: 503,
                message: "store unavailable".to_string(),
            });
        }
        inner
            .secrets
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        store.insert("app/db", json!({"password": "hunter2"}));

        let secret = store.get("app/db").await.unwrap();
        assert_eq!(secret.field("password"), Ok("hunter2"));
        assert_eq!(store.fetch_count("app/db"), 1);
    }

    #[tokio::test]
    async fn test_missing_and_failing_paths() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound { .. })
        ));

        store.insert("app/db", json!({"k": "v"}));
        store.fail("app/db");
        assert!(matches!(
            store.get("app/db").await,
            Err(StoreError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_stall_blocks_until_release() {
        let store = MemoryStore::new();
        store.insert("slow", json!({"k": "v"}));
        store.stall("slow");

        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.get("slow").await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert_eq!(store.fetch_count("slow"), 1);

        store.release("slow");
        let secret = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("Timed out waiting for released fetch")
            .unwrap()
            .unwrap();
        assert_eq!(secret.field("k"), Ok("v"));
    }
}
