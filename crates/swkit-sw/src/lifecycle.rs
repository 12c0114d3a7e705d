//! Generation lifecycle: worker states and the registration slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swkit_common::retry::{retry_when, RetryConfig};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::Clients;
use crate::config::{WorkerConfig, WorkerVersion};
use crate::router::CacheRouter;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Precaching its namespaces.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Cleaning up old namespaces.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

impl ServiceWorkerState {
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Parsed | Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

// ==================== Service Worker ====================

/// One generation of the worker.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub config: Arc<WorkerConfig>,
    state: ServiceWorkerState,
    router: CacheRouter,
}

impl ServiceWorker {
    pub fn new(config: Arc<WorkerConfig>, router: CacheRouter) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            config,
            state: ServiceWorkerState::Parsed,
            router,
        }
    }

    pub fn version(&self) -> &WorkerVersion {
        &self.config.version
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    pub fn router(&self) -> &CacheRouter {
        &self.router
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ServiceWorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceWorkerError::StateError(format!(
                "{} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        debug!(worker = %self.id, from = ?self.state, to = ?next, "State change");
        self.state = next;
        Ok(())
    }

    /// Make the worker redundant and stop its router writing to storage.
    fn retire(&mut self) {
        self.router.retire();
        if let Err(e) = self.transition(ServiceWorkerState::Redundant) {
            debug!(error = %e, "Worker already redundant");
        }
    }
}

/// What an activation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub worker: ServiceWorkerId,
    pub version: WorkerVersion,
    /// Namespaces garbage-collected, sorted.
    pub deleted_namespaces: Vec<String>,
    /// Clients now controlled by the new worker.
    pub claimed_clients: usize,
    /// Worker that was active before, now redundant.
    pub replaced: Option<ServiceWorkerId>,
}

// ==================== Registration ====================

#[derive(Debug, Default)]
struct Slots {
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
}

/// A scope's registration.
///
/// Network I/O during install happens outside the slot lock, so fetches keep
/// being served by the active worker while a new generation precaches.
#[derive(Debug)]
pub struct Registration {
    pub scope: Url,
    slots: RwLock<Slots>,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            slots: RwLock::new(Slots::default()),
        }
    }

    pub async fn active(&self) -> Option<ServiceWorker> {
        self.slots.read().await.active.clone()
    }

    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.slots.read().await.installing.clone()
    }

    /// Router of the active worker, if any.
    pub async fn controller(&self) -> Option<CacheRouter> {
        self.slots
            .read()
            .await
            .active
            .as_ref()
            .map(|worker| worker.router().clone())
    }

    /// Install a worker, retrying failed precache attempts with backoff.
    ///
    /// On success the worker sits in the waiting slot. On final failure it is
    /// redundant and nothing of it remains in the registration.
    pub async fn install_with_retry(&self, mut worker: ServiceWorker, retry: &RetryConfig) -> Result<ServiceWorkerId> {
        let id = worker.id;
        let version = worker.version().clone();
        let router = worker.router().clone();
        let plan = router.table().precache_plan(&worker.config)?;

        {
            let mut slots = self.slots.write().await;
            worker.transition(ServiceWorkerState::Installing)?;
            if let Some(mut previous) = slots.installing.replace(worker) {
                info!(worker = %previous.id, "Install superseded");
                previous.retire();
            }
        }

        info!(worker = %id, %version, "Installing");
        let result = retry_when(retry, || router.precache(&plan), ServiceWorkerError::is_retryable).await;

        let mut slots = self.slots.write().await;
        let mut worker = match slots.installing.take() {
            Some(current) if current.id == id => current,
            other => {
                slots.installing = other;
                return Err(ServiceWorkerError::StateError(format!(
                    "{id} was superseded during install"
                )));
            }
        };

        match result {
            Ok(count) => {
                worker.transition(ServiceWorkerState::Installed)?;
                if let Some(mut stale) = slots.waiting.replace(worker) {
                    stale.retire();
                }
                info!(worker = %id, entries = count, "Installed");
                Ok(id)
            }
            Err(e) => {
                warn!(worker = %id, error = %e, "Install failed");
                worker.retire();
                Err(e)
            }
        }
    }

    /// Activate the waiting worker.
    ///
    /// The previous worker is retired first, then old namespaces are deleted,
    /// then clients are claimed. Returns `None` when nothing is waiting.
    pub async fn activate(&self, clients: &Clients) -> Result<Option<ActivationReport>> {
        let mut slots = self.slots.write().await;
        let Some(mut worker) = slots.waiting.take() else {
            debug!("No waiting worker to activate");
            return Ok(None);
        };

        worker.transition(ServiceWorkerState::Activating)?;
        let replaced = slots.active.take().map(|mut old| {
            old.retire();
            old.id
        });
        let deleted_namespaces = worker.router().cleanup_namespaces().await;

        worker.transition(ServiceWorkerState::Activated)?;
        let claimed_clients = clients.claim(worker.id).await;

        let report = ActivationReport {
            worker: worker.id,
            version: worker.version().clone(),
            deleted_namespaces,
            claimed_clients,
            replaced,
        };
        info!(worker = %worker.id, version = %report.version, claimed = claimed_clients, "Activated");

        slots.active = Some(worker);
        Ok(Some(report))
    }

    /// Activate the waiting worker without waiting for old clients to close.
    pub async fn skip_waiting(&self, clients: &Clients) -> Result<Option<ActivationReport>> {
        self.activate(clients).await
    }
}
