//! Cache storage: named namespaces of request → response snapshots.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use swkit_net::{Request, Response, ResponseSource};
use url::Url;

use crate::config::NamespaceSet;

// ==================== Cache Entry ====================

/// Normalized request key: method plus fragment-free URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.clone(),
            url: request.normalized_url().to_string(),
        }
    }

    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET,
            url: url.to_string(),
        }
    }
}

/// A cached response snapshot.
///
/// Built from a clone of the network response, so the caller's copy stays
/// readable.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub method: Method,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn from_response(request: &Request, response: &Response) -> Self {
        Self {
            method: request.method.clone(),
            url: request.normalized_url(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body().clone(),
            cached_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.to_string(),
        }
    }

    /// Materialize a fresh response marked as served from cache.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.url.clone(), self.status)
            .with_body(self.body.clone())
            .with_source(ResponseSource::Cache);
        response.headers = self.headers.clone();
        response
    }
}

// ==================== Cache ====================

/// One named namespace.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    pub name: String,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the entry for its key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Cached URLs, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|k| k.url.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All namespaces on the origin, shared by every generation.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a namespace, creating it if missing.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Namespace names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// First match for `key` across `names`, in the given order.
    pub fn match_in<'a>(&self, names: impl IntoIterator<Item = &'a str>, key: &CacheKey) -> Option<&CacheEntry> {
        names
            .into_iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_key(key))
    }

    /// Delete every namespace not in `keep`. Returns the deleted names, sorted.
    pub fn retain_only(&mut self, keep: &NamespaceSet) -> Vec<String> {
        let mut deleted: Vec<String> = self
            .caches
            .keys()
            .filter(|name| !keep.contains(name))
            .cloned()
            .collect();
        deleted.sort_unstable();

        for name in &deleted {
            self.caches.remove(name);
        }
        deleted
    }

    /// Snapshot of every namespace and its entry count.
    pub fn report(&self, current: &NamespaceSet) -> CacheReport {
        let namespaces = self
            .keys()
            .into_iter()
            .filter_map(|name| {
                self.caches.get(&name).map(|cache| NamespaceReport {
                    current: current.contains(&name),
                    entries: cache.len(),
                    urls: cache.keys().into_iter().map(String::from).collect(),
                    name,
                })
            })
            .collect();

        CacheReport { namespaces }
    }
}

// ==================== Report ====================

/// Per-namespace listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceReport {
    pub name: String,
    pub entries: usize,
    /// Whether the namespace belongs to the active generation.
    pub current: bool,
    pub urls: Vec<String>,
}

/// What is cached right now, namespace by namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    pub namespaces: Vec<NamespaceReport>,
}

impl CacheReport {
    pub fn total_entries(&self) -> usize {
        self.namespaces.iter().map(|n| n.entries).sum()
    }

    pub fn names(&self) -> Vec<&str> {
        self.namespaces.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceReport> {
        self.namespaces.iter().find(|n| n.name == name)
    }
}
