//! Durable key-value store contract
//!
//! The quota engine persists everything through this interface. Backends only
//! have to provide `get`/`set`; the engine never talks to them directly but
//! goes through [`SafeStore`], which turns every failure into a sentinel so a
//! broken store can never take the state machine down with it.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ QuotaEngine / SessionTracker / EventLogger │
//! └────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌────────────────────────────────────────────┐
//! │ SafeStore                                  │
//! │   - get() -> StoreSnapshot (empty on err)  │
//! │   - set() -> bool                          │
//! └────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌────────────────────────────────────────────┐
//! │ trait KeyValueStore                        │
//! │   - get() / set() / compare_and_set()      │
//! └────────────────────────────────────────────┘
//!          │                       │
//!     ┌────┴────┐             ┌────┴────┐
//!     │ Memory  │             │ SQLite  │
//!     └─────────┘             └─────────┘
//! ```

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ============================================================================
// Error Types
// ============================================================================

/// Marker that hosts put in their failure message when the execution context
/// backing the store has been torn down.
const CONTEXT_INVALIDATED_MARKER: &str = "context invalidated";

/// Errors reported by store backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transient I/O failure, the data is assumed to still be there
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The execution context itself is gone, only a manual reload helps
    #[error("Context invalidated: {0}")]
    ContextInvalidated(String),

    /// The backend does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Classify a raw failure message coming from a backend.
    ///
    /// Messages mentioning an invalidated context map to
    /// [`StoreError::ContextInvalidated`], everything else is treated as a
    /// transient [`StoreError::Unavailable`].
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains(CONTEXT_INVALIDATED_MARKER) {
            StoreError::ContextInvalidated(message)
        } else {
            StoreError::Unavailable(message)
        }
    }

    /// Whether further automatic recovery is impossible
    pub fn is_context_invalidated(&self) -> bool {
        matches!(self, StoreError::ContextInvalidated(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::classify(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Asynchronous durable key-value store
///
/// Writes are last-write-wins. Several contexts may read-modify-write the
/// same keys concurrently; nothing here serializes them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short backend name used in log lines
    fn name(&self) -> &'static str;

    /// Fetch the given keys. Missing keys are simply absent from the result.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StoreError>;

    /// Write all given key/value pairs.
    async fn set(&self, values: HashMap<String, Value>) -> Result<(), StoreError>;

    /// Conditionally replace `key` if its current value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    ///
    /// Backends without conditional writes keep the default.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Value>,
        new: Value,
    ) -> Result<bool, StoreError> {
        let _ = (key, expected, new);
        Err(StoreError::Unsupported(format!(
            "{} does not support compare_and_set",
            self.name()
        )))
    }
}

// ============================================================================
// Safe Wrapper
// ============================================================================

/// Result of a read through [`SafeStore`]
///
/// `values` is empty whenever `failure` is set.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub values: HashMap<String, Value>,
    pub failure: Option<StoreError>,
}

impl StoreSnapshot {
    /// Whether the read succeeded
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    /// Look up a single value
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Never-failing facade over a [`KeyValueStore`]
#[derive(Clone)]
pub struct SafeStore {
    inner: Arc<dyn KeyValueStore>,
}

impl SafeStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// Read keys; on failure returns an empty snapshot carrying the error.
    pub async fn get(&self, keys: &[String]) -> StoreSnapshot {
        match self.inner.get(keys).await {
            Ok(values) => StoreSnapshot {
                values,
                failure: None,
            },
            Err(e) => {
                log::warn!("[store:{}] Read failed: {}", self.inner.name(), e);
                StoreSnapshot {
                    values: HashMap::new(),
                    failure: Some(e),
                }
            }
        }
    }

    /// Write values; returns `false` if the write did not go through.
    pub async fn set(&self, values: HashMap<String, Value>) -> bool {
        if values.is_empty() {
            return true;
        }
        match self.inner.set(values).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[store:{}] Write failed: {}", self.inner.name(), e);
                false
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
