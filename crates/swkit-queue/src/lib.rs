//! # swkit Offline Submission Queue
//!
//! Durable holding area for form submissions made while offline.
//!
//! ## Features
//!
//! - **Enqueue**: auto-assigned, strictly increasing ids
//! - **Drain**: deliver every pending entry to the remote endpoint, in
//!   insertion order, removing only what the endpoint acknowledged
//! - **Stores**: in-memory object store and a SQLite-backed durable log
//!
//! ## Architecture
//!
//! ```text
//! SubmissionQueue
//!     │
//!     ├── SubmissionStore (MemoryStore | SqliteStore)
//!     │       └── PendingSubmission { id, payload, created_at }
//!     │
//!     └── Fetcher ── POST {endpoint} (JSON payload)
//! ```
//!
//! Delivery is at-least-once. An entry is removed after the endpoint answers
//! 2xx; if the process dies between that answer and the removal, the entry is
//! delivered again on the next drain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use swkit_common::SwKitError;
use thiserror::Error;

pub mod queue;
pub mod sqlite;
pub mod store;

pub use queue::{DrainReport, SubmissionQueue};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, SubmissionStore};

// ==================== Errors ====================

/// Queue errors.
///
/// Delivery failures are not errors at this level; they leave the entry in
/// place and show up in the [`DrainReport`].
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] SwKitError),

    #[error("Payload encoding failed: {0}")]
    Encoding(String),
}

impl QueueError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage(SwKitError::storage(message))
    }

    pub(crate) fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage(SwKitError::storage_with_source(message, source))
    }
}

// ==================== Types ====================

/// Local identifier of a pending submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub u64);

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A form submission waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub id: SubmissionId,
    /// Opaque form data, sent verbatim as the JSON request body.
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_id_ordering() {
        assert!(SubmissionId(1) < SubmissionId(2));
        assert_eq!(SubmissionId(7).to_string(), "7");
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err = QueueError::storage("database is locked");
        assert_eq!(err.to_string(), "Storage error: database is locked");
    }
}
