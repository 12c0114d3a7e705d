//! Worker generation configuration.
//!
//! One `WorkerConfig` describes one cache generation: which namespaces it
//! owns, what it precaches, and which strategy table routes its requests.

use std::path::Path;

use serde::{Deserialize, Serialize};
use swkit_common::{Result, SwKitError};
use url::Url;

use crate::strategy::NamespaceKind;

/// Identifier of an installed cache generation. Never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerVersion(String);

impl WorkerVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a generation lays out its caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayout {
    /// Static + dynamic namespaces with per-class strategies.
    #[default]
    Split,
    /// Single combined namespace, cache-first for everything. Runtime writes
    /// take same-origin 200 responses only.
    Legacy,
}

/// The three namespace names owned by one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSet {
    pub static_name: String,
    pub dynamic_name: String,
    pub legacy_name: String,
}

impl NamespaceSet {
    pub fn new(prefix: &str, version: &WorkerVersion) -> Self {
        Self {
            static_name: format!("{prefix}-static-{version}"),
            dynamic_name: format!("{prefix}-dynamic-{version}"),
            legacy_name: format!("{prefix}-{version}"),
        }
    }

    /// Names in lookup order.
    pub fn names(&self) -> [&str; 3] {
        [&self.static_name, &self.dynamic_name, &self.legacy_name]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }

    pub fn name_for(&self, kind: NamespaceKind) -> &str {
        match kind {
            NamespaceKind::Static => &self.static_name,
            NamespaceKind::Dynamic => &self.dynamic_name,
            NamespaceKind::Legacy => &self.legacy_name,
        }
    }
}

/// Background sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync tag that triggers a queue drain.
    pub tag: String,
    /// Remote submission endpoint, relative to the origin or absolute.
    pub endpoint: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: "contact-form-sync".to_string(),
            endpoint: "/api/contact".to_string(),
        }
    }
}

/// Assets attached to push notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon: "/assets/images/icon-192x192.png".to_string(),
            badge: "/assets/images/badge-72x72.png".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

/// Configuration for one worker generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin of the controlled pages, as an absolute URL.
    pub origin: String,

    /// Prefix for cache namespace names.
    pub cache_prefix: String,

    /// Generation version embedded in namespace names.
    pub version: WorkerVersion,

    /// Cache layout, which selects the strategy table.
    pub layout: CacheLayout,

    /// Same-origin assets precached at install, in declaration order.
    pub static_assets: Vec<String>,

    /// Cross-origin resources precached at install.
    pub external_resources: Vec<String>,

    /// Document served for failed navigations. Must be a static asset.
    pub offline_fallback: String,

    /// Activate right after install instead of waiting for old clients.
    pub skip_waiting: bool,

    pub sync: SyncConfig,

    pub notifications: NotificationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "https://thegeeksinfo.com/".to_string(),
            cache_prefix: "thegeeksinfo".to_string(),
            version: WorkerVersion::new("v1.1.0"),
            layout: CacheLayout::Split,
            static_assets: [
                "/",
                "/index.html",
                "/offline.html",
                "/manifest.json",
                "/assets/css/style.css",
                "/assets/css/animations.css",
                "/assets/js/main.js",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            external_resources: vec![
                "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap"
                    .to_string(),
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css"
                    .to_string(),
            ],
            offline_fallback: "/offline.html".to_string(),
            skip_waiting: true,
            sync: SyncConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load and validate a configuration file (JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SwKitError::config_with_source(format!("Cannot read {}", path.display()), e)
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SwKitError::config_with_source("Invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the declarations are usable.
    pub fn validate(&self) -> Result<()> {
        self.origin_url()?;
        if self.version.as_str().trim().is_empty() {
            return Err(SwKitError::config("version must not be empty"));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(SwKitError::config("cache_prefix must not be empty"));
        }

        let statics = self.static_urls()?;
        self.external_urls()?;
        self.endpoint_url()?;

        let fallback = self.fallback_url()?;
        if !statics.contains(&fallback) {
            return Err(SwKitError::config(format!(
                "offline_fallback {} is not in static_assets",
                self.offline_fallback
            )));
        }

        Ok(())
    }

    pub fn namespaces(&self) -> NamespaceSet {
        NamespaceSet::new(&self.cache_prefix, &self.version)
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).map_err(|e| {
            SwKitError::config_with_source(format!("Bad origin {:?}", self.origin), e)
        })
    }

    /// Resolve a declared URL against the origin, dropping any fragment.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        let mut resolved = self
            .origin_url()?
            .join(url)
            .map_err(|e| SwKitError::config_with_source(format!("Bad URL {url:?}"), e))?;
        resolved.set_fragment(None);
        Ok(resolved)
    }

    pub fn static_urls(&self) -> Result<Vec<Url>> {
        self.static_assets.iter().map(|u| self.resolve(u)).collect()
    }

    pub fn external_urls(&self) -> Result<Vec<Url>> {
        self.external_resources.iter().map(|u| self.resolve(u)).collect()
    }

    pub fn fallback_url(&self) -> Result<Url> {
        self.resolve(&self.offline_fallback)
    }

    pub fn endpoint_url(&self) -> Result<Url> {
        self.resolve(&self.sync.endpoint)
    }
}
