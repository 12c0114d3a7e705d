//! Worker global scope: one dispatch table for every platform event.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use swkit_common::retry::RetryConfig;
use swkit_net::{Fetcher, Request, Response};
use swkit_queue::{DrainReport, SubmissionId, SubmissionQueue, SubmissionStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheReport, CacheStorage};
use crate::clients::{ClientId, Clients};
use crate::config::WorkerConfig;
use crate::lifecycle::{ActivationReport, Registration, ServiceWorker, ServiceWorkerId};
use crate::push::{parse_push, Notification, NotificationId, Notifications, ACTION_VIEW};
use crate::router::CacheRouter;
use crate::Result;

/// Platform signals delivered to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Sync { tag: String },
    Message(WorkerMessage),
    Push(Option<JsonValue>),
    NotificationClick {
        notification: NotificationId,
        action: Option<String>,
    },
}

/// Messages posted to the worker by a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Activate the waiting generation now.
    SkipWaiting,
    /// Hold a form submission until the next sync.
    QueueSubmission { payload: JsonValue },
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed {
        worker: ServiceWorkerId,
        activation: Option<ActivationReport>,
    },
    Activated(ActivationReport),
    /// Nothing was waiting to activate.
    Idle,
    Response(Response),
    Synced(DrainReport),
    Queued(SubmissionId),
    Notified(NotificationId),
    WindowOpened(ClientId),
    NotificationClosed,
    Ignored,
}

/// The worker's global scope.
pub struct ServiceWorkerGlobal {
    /// Deployed worker script, read at every install.
    config: RwLock<Arc<WorkerConfig>>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn SubmissionStore>,
    caches: Arc<RwLock<CacheStorage>>,
    registration: Registration,
    clients: Clients,
    notifications: Notifications,
    retry: RetryConfig,
}

impl ServiceWorkerGlobal {
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn SubmissionStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registration: Registration::new(config.origin_url()?),
            config: RwLock::new(Arc::new(config)),
            fetcher,
            store,
            caches: Arc::new(RwLock::new(CacheStorage::new())),
            clients: Clients::new(),
            notifications: Notifications::new(),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Deploy a new worker script. Takes effect at the next install.
    pub async fn update(&self, config: WorkerConfig) -> Result<()> {
        config.validate()?;
        info!(version = %config.version, "Worker script updated");
        *self.config.write().await = Arc::new(config);
        Ok(())
    }

    pub async fn config(&self) -> Arc<WorkerConfig> {
        Arc::clone(&*self.config.read().await)
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.caches
    }

    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
        match event {
            WorkerEvent::Install => self.on_install().await,
            WorkerEvent::Activate => self.on_activate().await,
            WorkerEvent::Fetch(request) => self.handle_fetch(&request).await.map(EventOutcome::Response),
            WorkerEvent::Sync { tag } => self.on_sync(&tag).await,
            WorkerEvent::Message(message) => self.on_message(message).await,
            WorkerEvent::Push(data) => self.on_push(data.as_ref()).await,
            WorkerEvent::NotificationClick {
                notification,
                action,
            } => self.on_notification_click(notification, action.as_deref()).await,
        }
    }

    /// Route a fetch through the active generation, or straight to the
    /// network when nothing controls the page yet.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Response> {
        match self.registration.controller().await {
            Some(router) => router.handle(request).await,
            None => {
                debug!(url = %request.url, "Uncontrolled fetch");
                Ok(self.fetcher.fetch(request).await?)
            }
        }
    }

    async fn on_install(&self) -> Result<EventOutcome> {
        let config = self.config().await;
        let router = CacheRouter::new(&config, Arc::clone(&self.caches), Arc::clone(&self.fetcher))?;
        let skip_waiting = config.skip_waiting;

        let worker = self
            .registration
            .install_with_retry(ServiceWorker::new(config, router), &self.retry)
            .await?;

        let activation = if skip_waiting {
            self.registration.skip_waiting(&self.clients).await?
        } else {
            None
        };

        Ok(EventOutcome::Installed { worker, activation })
    }

    async fn on_activate(&self) -> Result<EventOutcome> {
        Ok(self
            .registration
            .activate(&self.clients)
            .await?
            .map_or(EventOutcome::Idle, EventOutcome::Activated))
    }

    async fn on_sync(&self, tag: &str) -> Result<EventOutcome> {
        let config = self.config().await;
        if tag != config.sync.tag {
            debug!(tag, "Ignoring sync tag");
            return Ok(EventOutcome::Ignored);
        }

        info!(tag, "Background sync triggered");
        let report = self.queue(&config)?.drain().await?;
        info!(
            delivered = report.delivered.len(),
            retained = report.retained.len(),
            "Background sync finished"
        );
        Ok(EventOutcome::Synced(report))
    }

    async fn on_message(&self, message: WorkerMessage) -> Result<EventOutcome> {
        match message {
            WorkerMessage::SkipWaiting => Ok(self
                .registration
                .skip_waiting(&self.clients)
                .await?
                .map_or(EventOutcome::Idle, EventOutcome::Activated)),
            WorkerMessage::QueueSubmission { payload } => {
                let config = self.config().await;
                let id = self.queue(&config)?.enqueue(payload).await?;
                Ok(EventOutcome::Queued(id))
            }
        }
    }

    async fn on_push(&self, data: Option<&JsonValue>) -> Result<EventOutcome> {
        let Some(message) = parse_push(data)? else {
            debug!("Push without data");
            return Ok(EventOutcome::Ignored);
        };

        let config = self.config().await;
        let notification = Notification::from_push(message, &config.notifications);
        Ok(EventOutcome::Notified(self.notifications.show(notification).await))
    }

    async fn on_notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> Result<EventOutcome> {
        let Some(notification) = self.notifications.close(id).await else {
            return Ok(EventOutcome::Ignored);
        };

        if action != Some(ACTION_VIEW) {
            return Ok(EventOutcome::NotificationClosed);
        }

        let Some(target) = notification.url.as_deref() else {
            warn!(%id, "View clicked on notification without a URL");
            return Ok(EventOutcome::NotificationClosed);
        };

        let url = self.config().await.resolve(target)?;
        let controller = self.registration.active().await.map(|w| w.id);
        Ok(EventOutcome::WindowOpened(
            self.clients.open_window(url, controller).await,
        ))
    }

    fn queue(&self, config: &WorkerConfig) -> Result<SubmissionQueue> {
        Ok(SubmissionQueue::new(
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
            config.endpoint_url()?,
        ))
    }

    /// Every namespace on the origin, flagged against the active generation.
    pub async fn cache_report(&self) -> CacheReport {
        let current = match self.registration.active().await {
            Some(worker) => worker.router().namespaces().clone(),
            None => self.config().await.namespaces(),
        };
        self.caches.read().await.report(&current)
    }

    /// Wait for background cache work of the active generation.
    pub async fn settle(&self) {
        if let Some(router) = self.registration.controller().await {
            router.settle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheLayout, WorkerVersion};
    use crate::lifecycle::ServiceWorkerState;
    use crate::ServiceWorkerError;
    use serde_json::json;
    use std::time::Duration;
    use swkit_net::testing::ScriptedFetcher;
    use swkit_queue::{MemoryStore, QueueError};
    use url::Url;

    const ORIGIN: &str = "https://thegeeksinfo.com";
    const ENDPOINT: &str = "https://thegeeksinfo.com/api/contact";
    const FONT: &str = "https://fonts.googleapis.com/css2?family=Inter";

    fn url(path: &str) -> String {
        format!("{ORIGIN}{path}")
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            origin: ORIGIN.to_string(),
            version: WorkerVersion::new(version),
            static_assets: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/offline.html".to_string(),
                "/assets/js/main.js".to_string(),
            ],
            external_resources: vec![FONT.to_string()],
            ..Default::default()
        }
    }

    fn network() -> Arc<ScriptedFetcher> {
        let net = Arc::new(ScriptedFetcher::new());
        net.respond(&url("/"), 200, "home")
            .respond(&url("/index.html"), 200, "home")
            .respond(&url("/offline.html"), 200, "you are offline")
            .respond(&url("/assets/js/main.js"), 200, "main()")
            .respond(FONT, 200, "@font-face{}");
        net
    }

    fn global(config: WorkerConfig, net: &Arc<ScriptedFetcher>) -> ServiceWorkerGlobal {
        ServiceWorkerGlobal::new(config, net.clone(), Arc::new(MemoryStore::new()))
            .unwrap()
            .with_retry(RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            })
    }

    fn fetch(url: &str) -> WorkerEvent {
        WorkerEvent::Fetch(Request::parse(url).unwrap())
    }

    fn navigate(url: &str) -> WorkerEvent {
        WorkerEvent::Fetch(Request::navigate(Url::parse(url).unwrap()))
    }

    async fn response(global: &ServiceWorkerGlobal, event: WorkerEvent) -> Response {
        match global.dispatch(event).await.unwrap() {
            EventOutcome::Response(response) => response,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_install_skips_waiting_and_serves_from_cache() {
        let net = network();
        let sw = global(config("v2"), &net);

        match sw.dispatch(WorkerEvent::Install).await.unwrap() {
            EventOutcome::Installed { activation, .. } => assert!(activation.is_some()),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let before = net.total_calls();
        let main = response(&sw, fetch(&url("/assets/js/main.js"))).await;
        assert!(main.from_cache());
        assert_eq!(net.total_calls(), before);
    }

    #[tokio::test]
    async fn test_fetch_before_activation_is_uncontrolled() {
        let net = network();
        let sw = global(
            WorkerConfig {
                skip_waiting: false,
                ..config("v1")
            },
            &net,
        );
        sw.dispatch(WorkerEvent::Install).await.unwrap();

        let main = response(&sw, fetch(&url("/assets/js/main.js"))).await;
        assert!(!main.from_cache());

        assert!(matches!(
            sw.dispatch(WorkerEvent::Activate).await.unwrap(),
            EventOutcome::Activated(_)
        ));
        let main = response(&sw, fetch(&url("/assets/js/main.js"))).await;
        assert!(main.from_cache());
    }

    #[tokio::test]
    async fn test_skip_waiting_message() {
        let net = network();
        let sw = global(
            WorkerConfig {
                skip_waiting: false,
                ..config("v1")
            },
            &net,
        );
        sw.dispatch(WorkerEvent::Install).await.unwrap();
        assert_eq!(
            sw.registration().waiting().await.unwrap().state(),
            ServiceWorkerState::Installed
        );

        let message: WorkerMessage = serde_json::from_value(json!({"type": "SKIP_WAITING"})).unwrap();
        let outcome = sw.dispatch(WorkerEvent::Message(message)).await.unwrap();

        assert!(matches!(outcome, EventOutcome::Activated(_)));
        assert!(sw.registration().active().await.unwrap().is_active());

        let again = sw
            .dispatch(WorkerEvent::Message(WorkerMessage::SkipWaiting))
            .await
            .unwrap();
        assert!(matches!(again, EventOutcome::Idle));
    }

    #[tokio::test]
    async fn test_offline_navigation_shows_fallback() {
        let net = network();
        let sw = global(config("v1"), &net);
        sw.dispatch(WorkerEvent::Install).await.unwrap();

        net.set_online(false);
        let page = response(&sw, navigate(&url("/portfolio"))).await;
        assert_eq!(page.text().unwrap(), "you are offline");
    }

    #[tokio::test]
    async fn test_upgrade_collects_previous_generation() {
        let net = network();
        let sw = global(
            WorkerConfig {
                layout: CacheLayout::Legacy,
                ..config("v1.0.0")
            },
            &net,
        );
        sw.dispatch(WorkerEvent::Install).await.unwrap();
        assert_eq!(sw.cache_report().await.names(), vec!["thegeeksinfo-v1.0.0"]);

        sw.update(config("v1.1.0")).await.unwrap();
        sw.dispatch(WorkerEvent::Install).await.unwrap();

        let report = sw.cache_report().await;
        assert_eq!(
            report.names(),
            vec!["thegeeksinfo-dynamic-v1.1.0", "thegeeksinfo-static-v1.1.0"]
        );
        assert!(report.namespaces.iter().all(|n| n.current));
        assert_eq!(report.namespace("thegeeksinfo-static-v1.1.0").unwrap().entries, 4);
        assert_eq!(report.namespace("thegeeksinfo-dynamic-v1.1.0").unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_failed_install_surfaces_population_error() {
        let net = network();
        net.respond(&url("/assets/js/main.js"), 500, "");
        let sw = global(config("v1"), &net);

        let err = sw.dispatch(WorkerEvent::Install).await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::PopulationFailed { .. }));
        assert!(sw.registration().active().await.is_none());
        assert_eq!(net.call_count(&url("/assets/js/main.js")), 2);
    }

    #[tokio::test]
    async fn test_queued_submissions_drain_on_sync() {
        let net = network();
        net.respond_once(ENDPOINT, 200, "").respond_once(ENDPOINT, 422, "");
        let sw = global(config("v1"), &net);

        for name in ["p1", "p2"] {
            let message = WorkerMessage::QueueSubmission {
                payload: json!({"name": name}),
            };
            assert!(matches!(
                sw.dispatch(WorkerEvent::Message(message)).await.unwrap(),
                EventOutcome::Queued(_)
            ));
        }

        let outcome = sw
            .dispatch(WorkerEvent::Sync {
                tag: "contact-form-sync".to_string(),
            })
            .await
            .unwrap();

        let EventOutcome::Synced(report) = outcome else {
            panic!("expected drain report");
        };
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.retained.len(), 1);
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait::async_trait]
    impl SubmissionStore for ReadOnlyStore {
        async fn add(&self, _payload: JsonValue) -> std::result::Result<SubmissionId, QueueError> {
            Err(QueueError::Storage(swkit_common::SwKitError::storage("read-only")))
        }

        async fn list(&self) -> std::result::Result<Vec<swkit_queue::PendingSubmission>, QueueError> {
            self.0.list().await
        }

        async fn remove(&self, id: SubmissionId) -> std::result::Result<bool, QueueError> {
            self.0.remove(id).await
        }

        async fn len(&self) -> std::result::Result<usize, QueueError> {
            self.0.len().await
        }
    }

    #[tokio::test]
    async fn test_queue_submission_storage_fault_reaches_caller() {
        let net = network();
        let store = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let sw = ServiceWorkerGlobal::new(config("v1"), net.clone(), store.clone()).unwrap();

        let message = WorkerMessage::QueueSubmission {
            payload: json!({"name": "Ada"}),
        };
        let err = sw.dispatch(WorkerEvent::Message(message)).await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::Queue(QueueError::Storage(_))));
        assert!(err.is_retryable());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_other_sync_tags_ignored() {
        let net = network();
        let sw = global(config("v1"), &net);

        let outcome = sw
            .dispatch(WorkerEvent::Sync {
                tag: "newsletter-sync".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, EventOutcome::Ignored));
        assert_eq!(net.total_calls(), 0);
    }

    #[test]
    fn test_queue_submission_message_format() {
        let message: WorkerMessage = serde_json::from_value(json!({
            "type": "QUEUE_SUBMISSION",
            "payload": {"email": "a@b.c"}
        }))
        .unwrap();

        assert_eq!(
            message,
            WorkerMessage::QueueSubmission {
                payload: json!({"email": "a@b.c"})
            }
        );
    }

    #[tokio::test]
    async fn test_push_then_view_opens_window() {
        let net = network();
        let sw = global(config("v1"), &net);
        sw.dispatch(WorkerEvent::Install).await.unwrap();

        let outcome = sw
            .dispatch(WorkerEvent::Push(Some(json!({
                "title": "New article",
                "body": "Rust service workers",
                "url": "/blog/rust"
            }))))
            .await
            .unwrap();
        let EventOutcome::Notified(id) = outcome else {
            panic!("expected notification");
        };

        let click = WorkerEvent::NotificationClick {
            notification: id,
            action: Some("view".to_string()),
        };
        let EventOutcome::WindowOpened(client) = sw.dispatch(click).await.unwrap() else {
            panic!("expected window");
        };

        let opened = sw.clients().get(client).await.unwrap();
        assert_eq!(opened.url.as_str(), url("/blog/rust"));
        assert!(opened.focused);
        assert!(opened.controller.is_some());
        assert!(sw.notifications().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_dismiss_only_closes() {
        let net = network();
        let sw = global(config("v1"), &net);

        let EventOutcome::Notified(id) = sw
            .dispatch(WorkerEvent::Push(Some(json!({"title": "Hi", "url": "/"}))))
            .await
            .unwrap()
        else {
            panic!("expected notification");
        };

        let outcome = sw
            .dispatch(WorkerEvent::NotificationClick {
                notification: id,
                action: Some("dismiss".to_string()),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, EventOutcome::NotificationClosed));
        assert!(sw.clients().match_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_push_without_data_is_ignored() {
        let net = network();
        let sw = global(config("v1"), &net);

        let outcome = sw.dispatch(WorkerEvent::Push(None)).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Ignored));
        assert!(sw.notifications().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let net = network();
        let result = ServiceWorkerGlobal::new(
            WorkerConfig {
                offline_fallback: "/nope.html".to_string(),
                ..config("v1")
            },
            net,
            Arc::new(MemoryStore::new()),
        );
        assert!(result.is_err());
    }
}
