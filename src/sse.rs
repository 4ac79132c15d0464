//! SSE broadcast layer: a bounded-buffer client table with per-client event
//! filters, a heartbeat ticker, and slow-consumer eviction.
//!
//! Events fan out through per-client `mpsc` channels (single writer per
//! buffer, so per-client order matches broadcast order). A full buffer drops
//! that client rather than stalling the rest.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::config::SseConfig;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub const EVENT_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self { event_type: event_type.into(), data }
    }

    /// Wire frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_type, self.data)
    }
}

// ---------------------------------------------------------------------------
// Client table
// ---------------------------------------------------------------------------

struct ClientEntry {
    /// Empty set receives every event type.
    filters: HashSet<String>,
    tx: mpsc::Sender<Event>,
}

pub struct Broadcaster {
    cfg: SseConfig,
    clients: DashMap<String, ClientEntry>,
    history: Mutex<VecDeque<Event>>,
    running: AtomicBool,
    stop_tx: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl Broadcaster {
    pub fn new(cfg: SseConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            clients: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
        })
    }

    /// Register a client; the returned receiver yields its filtered events.
    /// Rejects when the table is full.
    pub fn register(
        &self,
        id: impl Into<String>,
        filters: impl IntoIterator<Item = String>,
    ) -> Result<mpsc::Receiver<Event>> {
        let id = id.into();
        if self.clients.len() >= self.cfg.max_clients {
            return Err(Error::Validation(format!(
                "client limit reached ({})",
                self.cfg.max_clients
            )));
        }
        let (tx, rx) = mpsc::channel(self.cfg.buffer_size.max(1));
        let filters: HashSet<String> = filters.into_iter().collect();
        self.clients.insert(id.clone(), ClientEntry { filters, tx });
        tracing::debug!(client = id.as_str(), total = self.clients.len(), "sse client registered");
        Ok(rx)
    }

    pub fn unregister(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            tracing::debug!(client = id, total = self.clients.len(), "sse client unregistered");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Fan an event out to every matching client. Clients whose buffer is
    /// full are dropped so one blocked consumer cannot delay the others.
    pub fn broadcast(&self, event: Event) {
        {
            let mut history = self.history.lock().unwrap();
            history.push_back(event.clone());
            while history.len() > self.cfg.history_size {
                history.pop_front();
            }
        }

        let mut evicted: Vec<String> = Vec::new();
        for entry in self.clients.iter() {
            let client = entry.value();
            if !client.filters.is_empty() && !client.filters.contains(&event.event_type) {
                continue;
            }
            match client.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    evicted.push(entry.key().clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(entry.key().clone());
                }
            }
        }
        for id in evicted {
            tracing::warn!(client = id.as_str(), "dropping slow sse client");
            self.clients.remove(&id);
        }
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// Start the heartbeat ticker. Idempotent.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = tokio::sync::watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(tx);

        let this = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.cfg.heartbeat_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.broadcast(Event::new(
                            EVENT_HEARTBEAT,
                            serde_json::json!({ "clients": this.clients.len() }),
                        ));
                    }
                    _ = rx.changed() => break,
                }
            }
        });
    }

    /// Stop the ticker and close every client channel. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        // Dropping the senders closes each client's receiver.
        self.clients.clear();
    }
}
