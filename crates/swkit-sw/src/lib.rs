//! # swkit Service Worker
//!
//! Caching service worker for a static site: routes every fetch through a
//! per-class caching strategy, manages versioned cache generations, drains the
//! offline form queue on background sync, and shows push notifications.
//!
//! ## Features
//!
//! - **Cache Router**: network-first, cache-first and stale-while-revalidate
//!   selected by request class
//! - **Generations**: versioned namespace sets, install-time precache,
//!   activation-time garbage collection
//! - **Lifecycle**: installing / waiting / active slots with validated state
//!   transitions and skip-waiting
//! - **Background Sync**: `contact-form-sync` drains the submission queue
//! - **Push**: notifications with view/dismiss actions
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerGlobal (dispatch: WorkerEvent → EventOutcome)
//!     │
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     │               └── CacheRouter
//!     │                       ├── Classifier → RequestClass
//!     │                       ├── StrategyTable → StrategyRule
//!     │                       └── CacheStorage (shared by all generations)
//!     │
//!     ├── Clients
//!     ├── Notifications
//!     └── SubmissionQueue (swkit-queue)
//! ```

use swkit_common::SwKitError;
use swkit_net::NetError;
use swkit_queue::QueueError;
use thiserror::Error;

pub mod cache;
pub mod classify;
pub mod clients;
pub mod config;
pub mod global;
pub mod lifecycle;
pub mod push;
pub mod router;
pub mod strategy;

pub use cache::{Cache, CacheEntry, CacheKey, CacheReport, CacheStorage, NamespaceReport};
pub use classify::{Classifier, RequestClass};
pub use clients::{Client, ClientId, Clients};
pub use config::{CacheLayout, NamespaceSet, WorkerConfig, WorkerVersion};
pub use global::{EventOutcome, ServiceWorkerGlobal, WorkerEvent, WorkerMessage};
pub use lifecycle::{ActivationReport, Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
pub use push::{Notification, NotificationAction, NotificationId, Notifications, PushMessage};
pub use router::CacheRouter;
pub use strategy::{NamespaceKind, PrecacheStep, StoreFilter, Strategy, StrategyRule, StrategyTable};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Failed to populate {namespace} with {url}: {reason}")]
    PopulationFailed {
        namespace: String,
        url: String,
        reason: String,
    },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] SwKitError),
}

impl ServiceWorkerError {
    /// Whether the platform should retry the operation that produced this.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::PopulationFailed { .. } => true,
            Self::Queue(QueueError::Storage(e)) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::PopulationFailed { .. } => "population",
            Self::StateError(_) => "state",
            Self::ScriptError(_) => "script",
            Self::Queue(_) => "queue",
            Self::Config(e) => e.category(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
