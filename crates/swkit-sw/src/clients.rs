//! Clients API: the pages a worker can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::lifecycle::ServiceWorkerId;

/// Client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A window client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub focused: bool,
    /// Worker currently controlling this page.
    pub controller: Option<ServiceWorkerId>,
}

/// Open pages in the worker's scope.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a page that was opened by the user.
    pub async fn add_window(&self, url: Url) -> ClientId {
        let client = Client {
            id: ClientId::new(),
            url,
            focused: false,
            controller: None,
        };
        let id = client.id;
        self.clients.write().await.insert(id, client);
        id
    }

    /// Open and focus a new window.
    pub async fn open_window(&self, url: Url, controller: Option<ServiceWorkerId>) -> ClientId {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            client.focused = false;
        }

        let client = Client {
            id: ClientId::new(),
            url,
            focused: true,
            controller,
        };
        let id = client.id;
        debug!(client = %id, url = %client.url, "Opened window");
        clients.insert(id, client);
        id
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// All clients, ordered by id.
    pub async fn match_all(&self) -> Vec<Client> {
        let mut all: Vec<Client> = self.clients.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Make `worker` the controller of every open client. Returns how many.
    pub async fn claim(&self, worker: ServiceWorkerId) -> usize {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            client.controller = Some(worker);
        }
        clients.len()
    }
}
