//! Strategy table keyed by cache layout.
//!
//! The router never branches on layout. Everything a generation does
//! differently lives in the table it is built with.

use serde::Serialize;
use swkit_net::Response;
use url::{Origin, Url};

use crate::classify::RequestClass;
use crate::config::{CacheLayout, WorkerConfig};
use crate::Result;

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Network, then cache on failure.
    NetworkFirst,
    /// Cache, then network on miss.
    CacheFirst,
    /// Cache now, refresh in the background.
    StaleWhileRevalidate,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NetworkFirst => "network-first",
            Self::CacheFirst => "cache-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        })
    }
}

/// Which namespace of the generation a rule writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Static,
    Dynamic,
    Legacy,
}

/// What is allowed into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFilter {
    /// Any 2xx except 206.
    Success,
    /// Exactly 200, and only from the page's own origin.
    SameOriginOk,
}

impl StoreFilter {
    pub fn admits(&self, response: &Response, origin: &Origin) -> bool {
        match self {
            Self::Success => response.is_cacheable(),
            Self::SameOriginOk => {
                response.status == http::StatusCode::OK && response.url.origin() == *origin
            }
        }
    }
}

/// How one request class is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StrategyRule {
    pub strategy: Strategy,
    pub namespace: NamespaceKind,
    /// Serve the offline document when nothing else is available.
    pub offline_fallback: bool,
}

impl StrategyRule {
    const fn new(strategy: Strategy, namespace: NamespaceKind, offline_fallback: bool) -> Self {
        Self {
            strategy,
            namespace,
            offline_fallback,
        }
    }
}

/// One namespace's install-time population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheStep {
    pub namespace: NamespaceKind,
    pub urls: Vec<Url>,
}

/// Per-generation routing rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyTable {
    pub layout: CacheLayout,
    navigation: StrategyRule,
    static_asset: StrategyRule,
    cross_origin: StrategyRule,
    other: StrategyRule,
    store: StoreFilter,
    /// Target namespace for `static_assets`.
    static_into: NamespaceKind,
    /// Target namespace for `external_resources`.
    external_into: NamespaceKind,
}

impl StrategyTable {
    pub fn for_layout(layout: CacheLayout) -> Self {
        use NamespaceKind::*;
        use Strategy::*;

        match layout {
            CacheLayout::Split => Self {
                layout,
                navigation: StrategyRule::new(NetworkFirst, Dynamic, true),
                static_asset: StrategyRule::new(CacheFirst, Static, false),
                cross_origin: StrategyRule::new(StaleWhileRevalidate, Dynamic, false),
                other: StrategyRule::new(NetworkFirst, Dynamic, false),
                store: StoreFilter::Success,
                static_into: Static,
                external_into: Dynamic,
            },
            CacheLayout::Legacy => Self {
                layout,
                navigation: StrategyRule::new(CacheFirst, Legacy, true),
                static_asset: StrategyRule::new(CacheFirst, Legacy, false),
                cross_origin: StrategyRule::new(CacheFirst, Legacy, false),
                other: StrategyRule::new(CacheFirst, Legacy, false),
                store: StoreFilter::SameOriginOk,
                static_into: Legacy,
                external_into: Legacy,
            },
        }
    }

    pub fn rule_for(&self, class: RequestClass) -> StrategyRule {
        match class {
            RequestClass::NavigationDocument => self.navigation,
            RequestClass::DeclaredStaticAsset => self.static_asset,
            RequestClass::CrossOriginResource => self.cross_origin,
            RequestClass::Other => self.other,
        }
    }

    /// Every class with its rule, in classification order.
    pub fn rules(&self) -> [(RequestClass, StrategyRule); 4] {
        RequestClass::ALL.map(|class| (class, self.rule_for(class)))
    }

    /// Whether a runtime network response may be written to cache.
    pub fn should_store(&self, response: &Response, origin: &Origin) -> bool {
        self.store.admits(response, origin)
    }

    /// Install-time population, one step per target namespace.
    pub fn precache_plan(&self, config: &WorkerConfig) -> Result<Vec<PrecacheStep>> {
        let statics = config.static_urls()?;
        let externals = config.external_urls()?;

        if self.static_into == self.external_into {
            let mut urls = statics;
            urls.extend(externals);
            return Ok(vec![PrecacheStep {
                namespace: self.static_into,
                urls,
            }]);
        }

        Ok(vec![
            PrecacheStep {
                namespace: self.static_into,
                urls: statics,
            },
            PrecacheStep {
                namespace: self.external_into,
                urls: externals,
            },
        ])
    }
}
