//! Cache Router: one `handle` per intercepted fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use swkit_net::{Fetcher, Request, Response};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStorage};
use crate::classify::Classifier;
use crate::config::{NamespaceSet, WorkerConfig};
use crate::strategy::{NamespaceKind, PrecacheStep, Strategy, StrategyRule, StrategyTable};
use crate::{Result, ServiceWorkerError};

/// Routes requests for one generation.
///
/// Cheap to clone; clones share the cache storage and the set of in-flight
/// background tasks.
#[derive(Clone)]
pub struct CacheRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Classifier,
    table: StrategyTable,
    namespaces: NamespaceSet,
    fallback: CacheKey,
    /// Cache writes and revalidations that outlive their `handle` call.
    tasks: Mutex<JoinSet<()>>,
    /// Set once the generation is replaced; background writes are dropped.
    retired: AtomicBool,
}

impl RouterInner {
    /// Commit a background write unless the generation has been retired.
    ///
    /// Checked under the storage write lock, so a write racing an activation
    /// either lands before the old namespaces are deleted or not at all.
    async fn commit(&self, namespace: &str, entry: CacheEntry) -> bool {
        let mut caches = self.caches.write().await;
        if self.retired.load(Ordering::Acquire) {
            debug!(namespace, url = %entry.url, "Generation retired, dropping write");
            return false;
        }
        caches.open(namespace).put(entry);
        true
    }
}

impl CacheRouter {
    pub fn new(
        config: &WorkerConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let statics = config.static_urls()?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                caches,
                fetcher,
                classifier: Classifier::new(&config.origin_url()?, &statics),
                table: StrategyTable::for_layout(config.layout),
                namespaces: config.namespaces(),
                fallback: CacheKey::get(&config.fallback_url()?),
                tasks: Mutex::new(JoinSet::new()),
                retired: AtomicBool::new(false),
            }),
        })
    }

    pub fn namespaces(&self) -> &NamespaceSet {
        &self.inner.namespaces
    }

    pub fn table(&self) -> &StrategyTable {
        &self.inner.table
    }

    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.inner.caches
    }

    /// Stop writing to the shared storage. Pending background writes are dropped.
    pub(crate) fn retire(&self) {
        self.inner.retired.store(true, Ordering::Release);
        self.tasks().abort_all();
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }

    /// Produce a response for an intercepted request.
    pub async fn handle(&self, request: &Request) -> Result<Response> {
        if !request.is_get() {
            debug!(method = %request.method, url = %request.url, "Passing through");
            return Ok(self.inner.fetcher.fetch(request).await?);
        }

        let class = self.inner.classifier.classify(request);
        let rule = self.inner.table.rule_for(class);
        debug!(url = %request.url, %class, strategy = %rule.strategy, "Routing request");

        match rule.strategy {
            Strategy::NetworkFirst => self.network_first(request, rule).await,
            Strategy::CacheFirst => self.cache_first(request, rule).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, rule).await,
        }
    }

    async fn network_first(&self, request: &Request, rule: StrategyRule) -> Result<Response> {
        match self.inner.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(rule.namespace, request, &response);
                Ok(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                if let Some(cached) = self.lookup(&CacheKey::for_request(request)).await {
                    return Ok(cached);
                }
                if rule.offline_fallback {
                    if let Some(document) = self.offline_document().await {
                        return Ok(document);
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn cache_first(&self, request: &Request, rule: StrategyRule) -> Result<Response> {
        if let Some(cached) = self.lookup(&CacheKey::for_request(request)).await {
            return Ok(cached);
        }

        match self.inner.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(rule.namespace, request, &response);
                Ok(response)
            }
            Err(e) => {
                if rule.offline_fallback {
                    if let Some(document) = self.offline_document().await {
                        return Ok(document);
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn stale_while_revalidate(&self, request: &Request, rule: StrategyRule) -> Result<Response> {
        let Some(cached) = self.lookup(&CacheKey::for_request(request)).await else {
            let response = self.inner.fetcher.fetch(request).await?;
            self.store(rule.namespace, request, &response);
            return Ok(response);
        };

        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        let namespace = self.inner.namespaces.name_for(rule.namespace).to_string();

        self.spawn(async move {
            match inner.fetcher.fetch(&request).await {
                Ok(fresh) if inner.table.should_store(&fresh, inner.classifier.origin()) => {
                    let entry = CacheEntry::from_response(&request, &fresh);
                    if inner.commit(&namespace, entry).await {
                        debug!(url = %request.url, "Revalidated");
                    }
                }
                Ok(fresh) => {
                    warn!(url = %request.url, status = %fresh.status, "Revalidation not cacheable");
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, "Revalidation failed");
                }
            }
        });

        Ok(cached)
    }

    /// First match across the current generation's namespaces.
    async fn lookup(&self, key: &CacheKey) -> Option<Response> {
        let caches = self.inner.caches.read().await;
        caches
            .match_in(self.inner.namespaces.names(), key)
            .map(CacheEntry::to_response)
    }

    async fn offline_document(&self) -> Option<Response> {
        let document = self.lookup(&self.inner.fallback).await;
        if document.is_none() {
            warn!(url = %self.inner.fallback.url, "Offline fallback not cached");
        }
        document
    }

    /// Write a clone of `response` in the background if the table admits it.
    fn store(&self, kind: NamespaceKind, request: &Request, response: &Response) {
        if !self.inner.table.should_store(response, self.inner.classifier.origin()) {
            debug!(url = %request.url, status = %response.status, "Not caching");
            return;
        }

        let entry = CacheEntry::from_response(request, response);
        let inner = Arc::clone(&self.inner);
        let namespace = self.inner.namespaces.name_for(kind).to_string();

        self.spawn(async move {
            inner.commit(&namespace, entry).await;
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for every background cache write and revalidation.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.tasks());
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                match joined {
                    Err(e) if !e.is_cancelled() => warn!(error = %e, "Background cache task failed"),
                    _ => {}
                }
            }
        }
    }

    /// Fetch every URL, then commit all of them to the namespace at once.
    ///
    /// Any transport failure or non-2xx answer fails the whole namespace and
    /// nothing is written.
    pub async fn populate(&self, kind: NamespaceKind, urls: &[Url]) -> Result<usize> {
        let namespace = self.inner.namespaces.name_for(kind).to_string();
        let fetcher = &self.inner.fetcher;

        let fetches = urls.iter().map(|url| {
            let request = Request::get(url.clone());
            async move {
                let result = fetcher.fetch(&request).await;
                (request, result)
            }
        });

        let mut staged = Vec::with_capacity(urls.len());
        for (request, result) in join_all(fetches).await {
            let failed = |reason: String| ServiceWorkerError::PopulationFailed {
                namespace: namespace.clone(),
                url: request.url.to_string(),
                reason,
            };

            let response = result.map_err(|e| failed(e.to_string()))?;
            if !response.ok() {
                return Err(failed(format!("status {}", response.status)));
            }
            staged.push(CacheEntry::from_response(&request, &response));
        }

        let count = staged.len();
        let mut caches = self.inner.caches.write().await;
        let cache = caches.open(&namespace);
        for entry in staged {
            cache.put(entry);
        }

        info!(namespace = %namespace, count, "Populated cache");
        Ok(count)
    }

    /// Run an install-time plan, one namespace at a time.
    pub async fn precache(&self, plan: &[PrecacheStep]) -> Result<usize> {
        let mut total = 0;
        for step in plan {
            total += self.populate(step.namespace, &step.urls).await?;
        }
        Ok(total)
    }

    /// Delete every namespace outside this generation. Returns the deleted names.
    pub async fn cleanup_namespaces(&self) -> Vec<String> {
        let deleted = self.inner.caches.write().await.retain_only(&self.inner.namespaces);
        for name in &deleted {
            info!(namespace = %name, "Deleting old cache");
        }
        deleted
    }
}

impl std::fmt::Debug for CacheRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRouter")
            .field("layout", &self.inner.table.layout)
            .field("namespaces", &self.inner.namespaces)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheLayout, WorkerVersion};
    use std::time::Duration;
    use swkit_net::testing::ScriptedFetcher;
    use swkit_net::ResponseSource;

    const ORIGIN: &str = "https://thegeeksinfo.com";
    const FONT: &str = "https://fonts.example.com/inter.css";

    fn config(layout: CacheLayout) -> WorkerConfig {
        WorkerConfig {
            origin: ORIGIN.to_string(),
            version: WorkerVersion::new("v2"),
            layout,
            static_assets: vec![
                "/".to_string(),
                "/offline.html".to_string(),
                "/assets/css/style.css".to_string(),
            ],
            external_resources: vec![FONT.to_string()],
            ..Default::default()
        }
    }

    fn url(path: &str) -> String {
        format!("{ORIGIN}{path}")
    }

    fn router_with(layout: CacheLayout, net: &Arc<ScriptedFetcher>) -> CacheRouter {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        CacheRouter::new(&config(layout), caches, net.clone()).unwrap()
    }

    fn script_site(net: &ScriptedFetcher) {
        net.respond(&url("/"), 200, "home")
            .respond(&url("/offline.html"), 200, "offline page")
            .respond(&url("/assets/css/style.css"), 200, "body{}")
            .respond(FONT, 200, "@font-face{}");
    }

    async fn installed(layout: CacheLayout, net: &Arc<ScriptedFetcher>) -> CacheRouter {
        script_site(net);
        let router = router_with(layout, net);
        let plan = router.table().precache_plan(&config(layout)).unwrap();
        router.precache(&plan).await.unwrap();
        router
    }

    fn navigate(path: &str) -> Request {
        Request::navigate(Url::parse(&url(path)).unwrap())
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    #[tokio::test]
    async fn test_static_assets_served_from_cache_after_install() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        let before = net.total_calls();

        for path in ["/offline.html", "/assets/css/style.css"] {
            let response = router.handle(&get(&url(path))).await.unwrap();
            assert!(response.from_cache(), "{path}");
        }

        assert_eq!(net.total_calls(), before);
    }

    #[tokio::test]
    async fn test_static_miss_fetches_once_then_caches() {
        let net = Arc::new(ScriptedFetcher::new());
        script_site(&net);
        let router = router_with(CacheLayout::Split, &net);
        let style = url("/assets/css/style.css");

        let first = router.handle(&get(&style)).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        router.settle().await;

        let second = router.handle(&get(&style)).await.unwrap();
        assert!(second.from_cache());
        assert_eq!(net.call_count(&style), 1);

        let caches = router.caches().read().await;
        assert_eq!(caches.get("thegeeksinfo-static-v2").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_navigation_online_returns_live_and_updates_dynamic() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        net.respond(&url("/about"), 200, "about v1");

        let response = router.handle(&navigate("/about")).await.unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.text().unwrap(), "about v1");

        router.settle().await;
        let caches = router.caches().read().await;
        let dynamic = caches.get("thegeeksinfo-dynamic-v2").unwrap();
        assert!(dynamic.keys().contains(&url("/about").as_str()));
    }

    #[tokio::test]
    async fn test_navigation_offline_uses_cached_entry() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        net.respond(&url("/blog"), 200, "blog");
        router.handle(&navigate("/blog")).await.unwrap();
        router.settle().await;

        net.set_online(false);
        let response = router.handle(&navigate("/blog")).await.unwrap();

        assert!(response.from_cache());
        assert_eq!(response.text().unwrap(), "blog");
    }

    #[tokio::test]
    async fn test_navigation_offline_without_entry_serves_fallback() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        net.set_online(false);

        let response = router.handle(&navigate("/never-visited")).await.unwrap();

        assert!(response.from_cache());
        assert_eq!(response.text().unwrap(), "offline page");
    }

    #[tokio::test]
    async fn test_navigation_not_found_is_returned_not_cached() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;

        let response = router.handle(&navigate("/missing")).await.unwrap();
        assert_eq!(response.status, http::StatusCode::NOT_FOUND);
        router.settle().await;

        net.set_online(false);
        let offline = router.handle(&navigate("/missing")).await.unwrap();
        assert_eq!(offline.text().unwrap(), "offline page");
    }

    #[tokio::test]
    async fn test_other_offline_without_entry_propagates() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        net.set_online(false);

        let err = router.handle(&get(&url("/api/data.json"))).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Network(_)));
    }

    #[tokio::test]
    async fn test_other_falls_back_to_cache() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        let data = url("/api/data.json");
        net.respond(&data, 200, "[1]");
        router.handle(&get(&data)).await.unwrap();
        router.settle().await;

        net.set_online(false);
        let response = router.handle(&get(&data)).await.unwrap();
        assert!(response.from_cache());
        assert_eq!(response.text().unwrap(), "[1]");
    }

    #[tokio::test]
    async fn test_swr_returns_cached_without_waiting_and_refreshes_once() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        assert_eq!(net.call_count(FONT), 1);
        net.respond(FONT, 200, "@font-face{v2}");

        net.pause();
        let response = tokio::time::timeout(Duration::from_secs(5), router.handle(&get(FONT)))
            .await
            .expect("cached response must not wait for the network")
            .unwrap();
        assert!(response.from_cache());
        assert_eq!(response.text().unwrap(), "@font-face{}");

        net.resume();
        router.settle().await;

        assert_eq!(net.call_count(FONT), 2);
        let refreshed = router.handle(&get(FONT)).await.unwrap();
        assert_eq!(refreshed.text().unwrap(), "@font-face{v2}");
    }

    #[tokio::test]
    async fn test_swr_refresh_failure_is_not_surfaced() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        net.fail(FONT);

        let response = router.handle(&get(FONT)).await.unwrap();
        router.settle().await;

        assert_eq!(response.text().unwrap(), "@font-face{}");
        let again = router.handle(&get(FONT)).await.unwrap();
        assert_eq!(again.text().unwrap(), "@font-face{}");
    }

    #[tokio::test]
    async fn test_swr_miss_with_failing_network_propagates() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = router_with(CacheLayout::Split, &net);
        net.fail("https://cdn.example.com/lib.js");

        let result = router.handle(&get("https://cdn.example.com/lib.js")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_non_get_passes_through_uncached() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        let endpoint = url("/api/contact");
        net.respond(&endpoint, 201, "");

        let request = Request::post(Url::parse(&endpoint).unwrap(), "{}".into());
        let response = router.handle(&request).await.unwrap();
        router.settle().await;

        assert_eq!(response.status, http::StatusCode::CREATED);
        let report = router.caches().read().await.report(router.namespaces());
        assert!(report
            .namespaces
            .iter()
            .all(|n| !n.urls.contains(&endpoint)));
    }

    #[tokio::test]
    async fn test_partial_content_not_cached() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = router_with(CacheLayout::Split, &net);
        let video = url("/media/intro.mp4");
        net.respond(&video, 206, "chunk");

        router.handle(&get(&video)).await.unwrap();
        router.settle().await;

        assert_eq!(router.caches().read().await.report(router.namespaces()).total_entries(), 0);
    }

    #[tokio::test]
    async fn test_populate_is_all_or_nothing() {
        let net = Arc::new(ScriptedFetcher::new());
        net.respond(&url("/"), 200, "home");
        net.respond(&url("/offline.html"), 404, "");
        let router = router_with(CacheLayout::Split, &net);

        let urls = vec![
            Url::parse(&url("/")).unwrap(),
            Url::parse(&url("/offline.html")).unwrap(),
        ];
        let err = router.populate(NamespaceKind::Static, &urls).await.unwrap_err();

        match err {
            ServiceWorkerError::PopulationFailed { namespace, url: failed, .. } => {
                assert_eq!(namespace, "thegeeksinfo-static-v2");
                assert!(failed.ends_with("/offline.html"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!router.caches().read().await.has("thegeeksinfo-static-v2"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_only_current_generation() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Split, &net).await;
        {
            let mut caches = router.caches().write().await;
            caches.open("thegeeksinfo-v1.0.0");
            caches.open("thegeeksinfo-static-v1");
        }

        let deleted = router.cleanup_namespaces().await;

        assert_eq!(deleted, vec!["thegeeksinfo-static-v1", "thegeeksinfo-v1.0.0"]);
        assert_eq!(
            router.caches().read().await.keys(),
            vec!["thegeeksinfo-dynamic-v2", "thegeeksinfo-static-v2"]
        );
    }

    #[tokio::test]
    async fn test_legacy_layout_uses_single_namespace() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Legacy, &net).await;

        assert_eq!(router.caches().read().await.keys(), vec!["thegeeksinfo-v2"]);

        // Cache-first even for navigations and cross-origin.
        let before = net.total_calls();
        assert!(router.handle(&navigate("/")).await.unwrap().from_cache());
        assert!(router.handle(&get(FONT)).await.unwrap().from_cache());
        router.settle().await;
        assert_eq!(net.total_calls(), before);
    }

    #[tokio::test]
    async fn test_legacy_offline_navigation_falls_back() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = installed(CacheLayout::Legacy, &net).await;
        net.set_online(false);

        let response = router.handle(&navigate("/contact")).await.unwrap();
        assert_eq!(response.text().unwrap(), "offline page");

        assert!(router.handle(&get(&url("/app.js"))).await.is_err());
    }

    #[tokio::test]
    async fn test_legacy_only_stores_200() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = router_with(CacheLayout::Legacy, &net);
        let page = url("/data.json");
        net.respond_once(&page, 203, "proxied").respond(&page, 200, "direct");

        router.handle(&get(&page)).await.unwrap();
        router.settle().await;
        assert_eq!(router.caches().read().await.report(router.namespaces()).total_entries(), 0);

        router.handle(&get(&page)).await.unwrap();
        router.settle().await;
        let cached = router.handle(&get(&page)).await.unwrap();
        assert!(cached.from_cache());
        assert_eq!(cached.text().unwrap(), "direct");
    }

    #[tokio::test]
    async fn test_legacy_does_not_store_cross_origin_at_runtime() {
        let net = Arc::new(ScriptedFetcher::new());
        let router = router_with(CacheLayout::Legacy, &net);
        let script = "https://cdn.example.net/widget.js";
        net.respond(script, 200, "widget()");

        router.handle(&get(script)).await.unwrap();
        router.settle().await;
        router.handle(&get(script)).await.unwrap();

        assert_eq!(net.call_count(script), 2);
        assert_eq!(router.caches().read().await.report(router.namespaces()).total_entries(), 0);
    }
}
