//! Submission store seam and the in-memory object store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::{PendingSubmission, QueueError, SubmissionId};

/// Keyed storage for pending submissions.
///
/// `list` returns entries in ascending id order, which is insertion order.
/// `remove` of an id that is already gone is `Ok(false)`, so two drains racing
/// on the same entry both succeed.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn add(&self, payload: JsonValue) -> Result<SubmissionId, QueueError>;

    async fn list(&self) -> Result<Vec<PendingSubmission>, QueueError>;

    async fn remove(&self, id: SubmissionId) -> Result<bool, QueueError>;

    async fn len(&self) -> Result<usize, QueueError>;
}

/// Auto-increment object store.
#[derive(Debug)]
struct ObjectStore {
    records: BTreeMap<u64, PendingSubmission>,
    /// Next auto-increment key. Never reused after delete.
    next_key: u64,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            next_key: 1,
        }
    }
}

/// In-memory store. Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<ObjectStore>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn add(&self, payload: JsonValue) -> Result<SubmissionId, QueueError> {
        let mut store = self.inner.write().await;
        let id = SubmissionId(store.next_key);
        store.next_key += 1;
        store.records.insert(
            id.0,
            PendingSubmission {
                id,
                payload,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<PendingSubmission>, QueueError> {
        Ok(self.inner.read().await.records.values().cloned().collect())
    }

    async fn remove(&self, id: SubmissionId) -> Result<bool, QueueError> {
        Ok(self.inner.write().await.records.remove(&id.0).is_some())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.read().await.records.len())
    }
}
