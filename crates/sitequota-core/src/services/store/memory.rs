//! In-process store
//!
//! Backs tests and hosts that do not need persistence across restarts.
//! Failures can be injected to exercise the engine's degraded paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{KeyValueStore, StoreError};

/// Map-backed [`KeyValueStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    read_failure: Mutex<Option<StoreError>>,
    write_failure: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail with `err` (`None` to heal)
    pub fn fail_reads(&self, err: Option<StoreError>) {
        if let Ok(mut slot) = self.read_failure.lock() {
            *slot = err;
        }
    }

    /// Make every subsequent write fail with `err` (`None` to heal)
    pub fn fail_writes(&self, err: Option<StoreError>) {
        if let Ok(mut slot) = self.write_failure.lock() {
            *slot = err;
        }
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    fn injected(slot: &Mutex<Option<StoreError>>) -> Option<StoreError> {
        slot.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StoreError> {
        if let Some(err) = Self::injected(&self.read_failure) {
            return Err(err);
        }
        let data = self.data.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, values: HashMap<String, Value>) -> Result<(), StoreError> {
        if let Some(err) = Self::injected(&self.write_failure) {
            return Err(err);
        }
        let mut data = self.data.write().await;
        data.extend(values);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Value>,
        new: Value,
    ) -> Result<bool, StoreError> {
        if let Some(err) = Self::injected(&self.write_failure) {
            return Err(err);
        }
        let mut data = self.data.write().await;
        if data.get(key) != expected.as_ref() {
            log::debug!("[store:memory] compare_and_set lost race on {}", key);
            return Ok(false);
        }
        data.insert(key.to_string(), new);
        Ok(true)
    }
}
