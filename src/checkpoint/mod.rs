//! Checkpoint persistence layer
//!
//! Stores one `ConversationState` per thread id as an opaque JSON blob.
//! Writes carry the version they were based on; a stale writer gets a
//! `VersionConflict` instead of silently clobbering another turn.

use crate::error::OrchestrationError;
use crate::models::ConversationState;
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub mod postgres;

pub use postgres::PostgresCheckpointStore;

/// A persisted state plus the version it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub state: ConversationState,
    pub version: u64,
}

/// Trait for checkpoint persistence
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when the thread has never been saved.
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Atomically replace the record if it is still at `expected_version`
    /// (0 = must not exist yet). Returns the new version.
    async fn save(&self, thread_id: &str, state: &ConversationState, expected_version: u64) -> Result<u64>;
}

pub(crate) fn encode(state: &ConversationState) -> Result<String> {
    Ok(serde_json::to_string(state)?)
}

pub(crate) fn decode(thread_id: &str, blob: &str) -> Result<ConversationState> {
    serde_json::from_str(blob).map_err(|e| {
        OrchestrationError::StorageError(format!("corrupt checkpoint for thread {}: {}", thread_id, e))
    })
}

async fn with_timeout<T>(timeout: Duration, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        OrchestrationError::StorageError(format!("checkpoint {} timed out after {:?}", op, timeout))
    })?
}

/// A turn's handle on one thread's record: remembers the version it last
/// saw and bounds every storage call by a timeout.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    thread_id: String,
    version: u64,
    timeout: Duration,
}

impl Checkpointer {
    /// Load the thread's state, if any, and start tracking its version.
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        thread_id: &str,
        timeout: Duration,
    ) -> Result<(Self, Option<ConversationState>)> {
        let loaded = with_timeout(timeout, "load", store.load(thread_id)).await?;
        let (version, state) = match loaded {
            Some(checkpoint) => (checkpoint.version, Some(checkpoint.state)),
            None => (0, None),
        };

        let checkpointer = Self {
            store,
            thread_id: thread_id.to_string(),
            version,
            timeout,
        };
        Ok((checkpointer, state))
    }

    pub async fn save(&mut self, state: &ConversationState) -> Result<()> {
        let next = with_timeout(
            self.timeout,
            "save",
            self.store.save(&self.thread_id, state, self.version),
        )
        .await?;

        debug!(thread_id = %self.thread_id, version = next, messages = state.messages.len(), "Checkpoint saved");
        self.version = next;
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// In-memory checkpoint store for development and tests
pub struct InMemoryCheckpointStore {
    records: Arc<RwLock<HashMap<String, (u64, String)>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let records = self.records.read().await;
        match records.get(thread_id) {
            Some((version, blob)) => Ok(Some(Checkpoint {
                state: decode(thread_id, blob)?,
                version: *version,
            })),
            None => Ok(None),
        }
    }

    async fn save(&self, thread_id: &str, state: &ConversationState, expected_version: u64) -> Result<u64> {
        let blob = encode(state)?;

        let mut records = self.records.write().await;
        let current = records.get(thread_id).map(|(v, _)| *v).unwrap_or(0);
        if current != expected_version {
            return Err(OrchestrationError::VersionConflict {
                thread_id: thread_id.to_string(),
                expected: expected_version,
                found: current,
            });
        }

        let next = current + 1;
        records.insert(thread_id.to_string(), (next, blob));
        Ok(next)
    }
}
