//! Push messages and the notifications they show.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::NotificationConfig;
use crate::{Result, ServiceWorkerError};

/// Notification identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification-{}", self.0)
    }
}

/// Push payload sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushMessage {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// A shown notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// Page opened by the `view` action.
    pub url: Option<String>,
    pub actions: Vec<NotificationAction>,
}

pub const ACTION_VIEW: &str = "view";
pub const ACTION_DISMISS: &str = "dismiss";

impl Notification {
    pub fn from_push(message: PushMessage, assets: &NotificationConfig) -> Self {
        Self {
            id: NotificationId::new(),
            title: message.title,
            body: message.body,
            icon: assets.icon.clone(),
            badge: assets.badge.clone(),
            vibrate: assets.vibrate.clone(),
            url: message.url,
            actions: vec![
                NotificationAction {
                    action: ACTION_VIEW.to_string(),
                    title: "View".to_string(),
                    icon: "/assets/images/view-icon.png".to_string(),
                },
                NotificationAction {
                    action: ACTION_DISMISS.to_string(),
                    title: "Dismiss".to_string(),
                    icon: "/assets/images/dismiss-icon.png".to_string(),
                },
            ],
        }
    }
}

/// Parse a push payload. `None` for pushes that carry no data.
pub fn parse_push(data: Option<&JsonValue>) -> Result<Option<PushMessage>> {
    let Some(data) = data else {
        return Ok(None);
    };
    serde_json::from_value(data.clone())
        .map(Some)
        .map_err(|e| ServiceWorkerError::ScriptError(format!("Invalid push payload: {e}")))
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: RwLock<HashMap<NotificationId, Notification>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn show(&self, notification: Notification) -> NotificationId {
        let id = notification.id;
        info!(%id, title = %notification.title, "Showing notification");
        self.shown.write().await.insert(id, notification);
        id
    }

    /// Close a notification, returning it if it was open.
    pub async fn close(&self, id: NotificationId) -> Option<Notification> {
        let closed = self.shown.write().await.remove(&id);
        if closed.is_none() {
            debug!(%id, "Notification already closed");
        }
        closed
    }

    /// Open notifications, ordered by id.
    pub async fn list(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.shown.read().await.values().cloned().collect();
        all.sort_by_key(|n| n.id);
        all
    }
}
