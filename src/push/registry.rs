//! Per-user fan-out registry for live notifications.
//!
//! Delivery is at-most-once and best-effort: a push goes to the sinks that
//! are registered at that instant, with no buffering for offline users and
//! no retry. A sink whose receiver is gone is dropped during the push that
//! discovers it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Per-sink buffer. A sink this far behind misses events.
pub const DEFAULT_SINK_BUFFER: usize = 64;

/// Identifies one registered sink.
pub type SinkId = Uuid;

/// A named JSON event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl PushEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

struct ClientSink {
    id: SinkId,
    tx: mpsc::Sender<PushEvent>,
}

/// Process-wide map of user id → open sinks.
pub struct PushRegistry {
    clients: RwLock<HashMap<String, Vec<ClientSink>>>,
    buffer: usize,
}

impl Default for PushRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SINK_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register an existing sender for `user_id`.
    pub fn add_client(&self, user_id: &str, tx: mpsc::Sender<PushEvent>) -> SinkId {
        let id = Uuid::new_v4();
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let sinks = clients.entry(user_id.to_string()).or_default();
        sinks.push(ClientSink { id, tx });
        debug!(user_id, sink_id = %id, sinks = sinks.len(), "Push client registered");
        id
    }

    /// Create a channel, register its sender, and hand back the receiver.
    pub fn subscribe(&self, user_id: &str) -> (SinkId, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        (self.add_client(user_id, tx), rx)
    }

    /// Unregister one sink. The user's entry goes away with its last sink.
    pub fn remove_client(&self, user_id: &str, sink_id: SinkId) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let Some(sinks) = clients.get_mut(user_id) else {
            return false;
        };

        let before = sinks.len();
        sinks.retain(|s| s.id != sink_id);
        let removed = sinks.len() < before;
        if sinks.is_empty() {
            clients.remove(user_id);
        }
        if removed {
            debug!(user_id, sink_id = %sink_id, "Push client removed");
        }
        removed
    }

    /// Send `event` to every sink registered for `user_id`.
    ///
    /// Returns how many sinks accepted the event. Zero sinks is a silent no-op.
    pub fn push(&self, user_id: &str, event: &str, data: serde_json::Value) -> usize {
        let snapshot: Vec<(SinkId, mpsc::Sender<PushEvent>)> = {
            let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
            match clients.get(user_id) {
                Some(sinks) => sinks.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => {
                    trace!(user_id, event, "No push clients, event dropped");
                    return 0;
                }
            }
        };

        let payload = PushEvent::new(event, data);
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user_id, sink_id = %id, event, "Push client lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.remove_client(user_id, id);
        }

        debug!(user_id, event, delivered, "Pushed event");
        delivered
    }

    pub fn client_count(&self, user_id: &str) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map_or(0, Vec::len)
    }

    pub fn user_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
