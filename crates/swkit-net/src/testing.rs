//! Scripted in-memory network for tests.
//!
//! Routes are keyed by absolute URL. One-shot replies queued with
//! [`ScriptedFetcher::respond_once`] are consumed before the standing reply
//! for that URL. Unrouted URLs answer 404.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::sync::watch;
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Reply {
    Respond { status: StatusCode, body: Bytes },
    Fail(String),
}

/// A request the fetcher saw.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
}

#[derive(Default)]
struct Routes {
    standing: HashMap<String, Reply>,
    once: HashMap<String, VecDeque<Reply>>,
}

/// Deterministic fetcher with an online switch and a pause gate.
pub struct ScriptedFetcher {
    routes: Mutex<Routes>,
    calls: Mutex<Vec<RecordedCall>>,
    online: AtomicBool,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            routes: Mutex::new(Routes::default()),
            calls: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            gate,
        }
    }

    /// Standing reply for a URL.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.routes().standing.insert(url.to_string(), respond(status, body));
        self
    }

    /// Reply used for the next request to a URL only.
    pub fn respond_once(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.routes()
            .once
            .entry(url.to_string())
            .or_default()
            .push_back(respond(status, body));
        self
    }

    /// Make a URL fail at the transport level.
    pub fn fail(&self, url: &str) -> &Self {
        self.routes()
            .standing
            .insert(url.to_string(), Reply::Fail(format!("connection refused: {url}")));
        self
    }

    /// Toggle whole-network reachability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Hold every fetch at its first await point until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|call| call.url.as_str() == url).count())
            .unwrap_or_default()
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut routes = self.routes();
        if let Some(reply) = routes.once.get_mut(url).and_then(VecDeque::pop_front) {
            return Some(reply);
        }
        routes.standing.get(url).cloned()
    }
}

fn respond(status: u16, body: impl Into<Bytes>) -> Reply {
    Reply::Respond {
        status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body: body.into(),
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                method: request.method.clone(),
                url: request.url.clone(),
                body: request.body.clone(),
            });
        }

        let mut gate = self.gate.subscribe();
        // Sender lives as long as self, so this only errs on teardown.
        let _ = gate.wait_for(|open| *open).await;

        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        match self.next_reply(request.url.as_str()) {
            Some(Reply::Respond { status, body }) => {
                Ok(Response::new(request.url.clone(), status).with_body(body))
            }
            Some(Reply::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND)),
        }
    }
}
