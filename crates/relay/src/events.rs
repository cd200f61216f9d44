use crate::session::{ConnectionState, ToolInfo, unix_now_millis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One lifecycle event on the push channel.
///
/// Wire shape: `{type, sessionId, timestamp, ...variant fields}`. Events are
/// append-only and ordered per session; nothing is guaranteed across
/// sessions. There is no replay: a subscriber that connects after an event
/// was published has missed it and must reconcile via a snapshot read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    #[serde(flatten)]
    pub kind: ConnectionEventKind,
    pub session_id: String,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ConnectionEventKind {
    StateChanged { state: ConnectionState },
    ToolsDiscovered { tools: Vec<ToolInfo> },
    AuthRequired { auth_url: String },
    Error { error: String },
    Disconnected { reason: String },
    Progress { message: String },
}

/// Per-identity broadcast of [`ConnectionEvent`]s.
///
/// Publishing is fire-and-forget: a missing, slow, or lagged subscriber
/// never blocks the publishing state machine.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<ConnectionEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, identity: &str) -> broadcast::Receiver<ConnectionEvent> {
        if let Some(tx) = self.channels.read().expect("event bus lock").get(identity) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write().expect("event bus lock");
        channels
            .entry(identity.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn publish(&self, identity: &str, session_id: &str, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            kind,
            session_id: session_id.to_string(),
            timestamp: unix_now_millis(),
        };
        let channels = self.channels.read().expect("event bus lock");
        if let Some(tx) = channels.get(identity) {
            // No receivers is fine; late subscribers reconcile via snapshot.
            let _ = tx.send(event);
        }
    }
}
