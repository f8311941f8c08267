//! Process-wide runtime event bus: every `gateway.*`, `orchestration.*`,
//! `provider.*` and `subagents.*` notification fans out through here so the
//! control plane's `/events` SSE handler has one place to subscribe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// How many past events `/events`'s connect-time snapshot replays.
const RECENT_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub id: u64,
    pub name: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Broadcasts runtime events to every subscriber (SSE connections, the
/// restart controller's own audit trail, etc) and retains the last
/// [`RECENT_EVENT_CAPACITY`] for the SSE snapshot frame a new subscriber
/// gets on connect.
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
    next_id: AtomicU64,
    recent: Mutex<VecDeque<RuntimeEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            next_id: AtomicU64::new(1),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENT_CAPACITY)),
        }
    }

    pub fn emit(&self, name: &str, payload: Value) -> RuntimeEvent {
        let event = RuntimeEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            payload,
            at: Utc::now(),
        };
        {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() == RECENT_EVENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// The last up-to-100 events, oldest first — used for the `/events`
    /// connect-time snapshot frame.
    pub fn recent(&self) -> Vec<RuntimeEvent> {
        self.recent.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_carry_monotonically_increasing_ids() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit("gateway.starting", serde_json::json!({}));
        bus.emit("gateway.started", serde_json::json!({}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id + 1, second.id);
        assert_eq!(second.name, "gateway.started");
    }
}
