//! Enqueue and drain.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use swkit_net::{Fetcher, Request};
use tracing::{debug, info, warn};
use url::Url;

use crate::store::SubmissionStore;
use crate::{QueueError, SubmissionId};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries a delivery was attempted for.
    pub attempted: usize,
    /// Entries acknowledged and removed.
    pub delivered: Vec<SubmissionId>,
    /// Entries left in place for the next drain.
    pub retained: Vec<SubmissionId>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

/// Offline submission queue bound to one remote endpoint.
#[derive(Clone)]
pub struct SubmissionQueue {
    store: Arc<dyn SubmissionStore>,
    fetcher: Arc<dyn Fetcher>,
    endpoint: Url,
}

impl SubmissionQueue {
    pub fn new(store: Arc<dyn SubmissionStore>, fetcher: Arc<dyn Fetcher>, endpoint: Url) -> Self {
        Self {
            store,
            fetcher,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    /// Hold a submission for later delivery.
    ///
    /// The payload is not inspected. Only a storage fault fails this call.
    pub async fn enqueue(&self, payload: JsonValue) -> Result<SubmissionId, QueueError> {
        let id = self.store.add(payload).await?;
        info!(%id, "Queued offline submission");
        Ok(id)
    }

    /// Deliver every pending submission once.
    ///
    /// Entries are posted in insertion order. A failed delivery leaves its
    /// entry in place and moves on to the next one. A storage fault aborts the
    /// rest of the batch; the next drain starts over from a fresh listing.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let pending = self.store.list().await?;
        let mut report = DrainReport::default();

        if pending.is_empty() {
            debug!("No pending submissions");
            return Ok(report);
        }

        debug!(count = pending.len(), endpoint = %self.endpoint, "Draining submissions");

        for submission in pending {
            report.attempted += 1;

            let request = match Request::post_json(self.endpoint.clone(), &submission.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(id = %submission.id, error = %e, "Cannot encode submission");
                    report.retained.push(submission.id);
                    continue;
                }
            };

            match self.fetcher.fetch(&request).await {
                Ok(response) if response.ok() => {
                    self.store.remove(submission.id).await?;
                    info!(id = %submission.id, "Form submission synced");
                    report.delivered.push(submission.id);
                }
                Ok(response) => {
                    warn!(id = %submission.id, status = %response.status, "Submission rejected");
                    report.retained.push(submission.id);
                }
                Err(e) => {
                    warn!(id = %submission.id, error = %e, "Failed to sync submission");
                    report.retained.push(submission.id);
                }
            }
        }

        Ok(report)
    }
}
