//! Per-session orchestration lanes (§4.4): a single active turn plus a
//! FIFO of pending turns, governed by a concurrency mode.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::storage::atomic;

const LANES_FILE: &str = "orchestration-lanes.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneMode {
    Queue,
    Interrupt,
    Collect,
    Steer,
    SteerBacklog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Old,
    New,
    Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnInput {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Runtime events the lane manager emits on every enqueue/dequeue, per
/// §4.4 ("emits `orchestration.submitted|started|completed|dropped`").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    Submitted { session_id: String },
    Started { session_id: String },
    Completed { session_id: String },
    Dropped { session_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LaneSnapshot {
    session_id: String,
    mode: LaneMode,
    active_input: Option<TurnInput>,
    queued_inputs: Vec<TurnInput>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanesFile {
    version: u32,
    lanes: Vec<LaneSnapshot>,
}

struct Lane {
    mode: LaneMode,
    cap: usize,
    drop_policy: DropPolicy,
    collect_debounce: Duration,
    active: Option<TurnInput>,
    queued: Vec<TurnInput>,
    active_cancel: Option<tokio::sync::oneshot::Sender<()>>,
    collect_deadline: Option<Instant>,
}

impl Lane {
    fn new(mode: LaneMode, cap: usize, drop_policy: DropPolicy, collect_debounce_ms: u64) -> Self {
        Self {
            mode,
            cap,
            drop_policy,
            collect_debounce: Duration::from_millis(collect_debounce_ms),
            active: None,
            queued: Vec::new(),
            active_cancel: None,
            collect_deadline: None,
        }
    }

    fn snapshot(&self, session_id: &str) -> LaneSnapshot {
        LaneSnapshot {
            session_id: session_id.to_string(),
            mode: self.mode,
            active_input: self.active.clone(),
            queued_inputs: self.queued.clone(),
        }
    }
}

/// Owns one [`Lane`] per session and the bookkeeping to persist/rehydrate
/// them across restarts.
pub struct LaneManager {
    lanes: Mutex<HashMap<String, Lane>>,
    events: mpsc::UnboundedSender<OrchestrationEvent>,
    persist_dir: Option<std::path::PathBuf>,
}

impl LaneManager {
    pub fn new(persist_dir: Option<std::path::PathBuf>) -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                lanes: Mutex::new(HashMap::new()),
                events: tx,
                persist_dir,
            },
            rx,
        )
    }

    fn emit(&self, event: OrchestrationEvent) {
        let _ = self.events.send(event);
    }

    pub async fn ensure_lane(&self, session_id: &str, mode: LaneMode, cap: usize, drop_policy: DropPolicy, collect_debounce_ms: u64) {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(session_id.to_string())
            .or_insert_with(|| Lane::new(mode, cap, drop_policy, collect_debounce_ms));
    }

    /// Submit a turn input to a session's lane, applying the mode's
    /// concurrency policy. Returns whether the submission became (or
    /// joined) the active turn immediately.
    pub async fn submit(&self, session_id: &str, input: TurnInput) -> Result<bool, GatewayError> {
        self.emit(OrchestrationEvent::Submitted { session_id: session_id.to_string() });
        let mut lanes = self.lanes.lock().await;
        let lane = lanes
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("no lane for session {session_id}")))?;

        let became_active = match lane.mode {
            LaneMode::Interrupt => {
                if let Some(cancel) = lane.active_cancel.take() {
                    let _ = cancel.send(());
                }
                lane.active = Some(input);
                true
            }
            LaneMode::Queue => {
                if lane.active.is_none() {
                    lane.active = Some(input);
                    true
                } else if lane.queued.len() >= lane.cap {
                    self.apply_drop_policy(lane, session_id, input);
                    false
                } else {
                    lane.queued.push(input);
                    false
                }
            }
            LaneMode::Collect => {
                lane.queued.push(input);
                lane.collect_deadline = Some(Instant::now() + lane.collect_debounce);
                false
            }
            LaneMode::Steer | LaneMode::SteerBacklog => {
                if lane.active.is_none() {
                    lane.active = Some(input);
                    true
                } else if matches!(lane.mode, LaneMode::SteerBacklog) {
                    lane.queued.push(input);
                    false
                } else {
                    debug!(session_id, "steer mode: feeding text into active turn");
                    false
                }
            }
        };

        if became_active {
            self.emit(OrchestrationEvent::Started { session_id: session_id.to_string() });
        }
        drop(lanes);
        self.persist().await;
        Ok(became_active)
    }

    fn apply_drop_policy(&self, lane: &mut Lane, session_id: &str, incoming: TurnInput) {
        match lane.drop_policy {
            DropPolicy::Old => {
                if !lane.queued.is_empty() {
                    lane.queued.remove(0);
                }
                lane.queued.push(incoming);
                self.emit(OrchestrationEvent::Dropped {
                    session_id: session_id.to_string(),
                    reason: "old".to_string(),
                });
            }
            DropPolicy::New => {
                self.emit(OrchestrationEvent::Dropped {
                    session_id: session_id.to_string(),
                    reason: "new".to_string(),
                });
            }
            DropPolicy::Summarize => {
                let mut combined = lane.queued.iter().map(|t| t.text.clone()).collect::<Vec<_>>();
                combined.push(incoming.text.clone());
                let merged = TurnInput {
                    text: combined.join("\n---\n"),
                    provider_id: incoming.provider_id,
                };
                lane.queued = vec![merged];
                self.emit(OrchestrationEvent::Dropped {
                    session_id: session_id.to_string(),
                    reason: "summarize".to_string(),
                });
            }
        }
    }

    /// Mark the active turn complete and promote the next queued input, if
    /// any. Returns the newly-active input, if promotion occurred.
    pub async fn complete_active(&self, session_id: &str) -> Option<TurnInput> {
        let mut lanes = self.lanes.lock().await;
        let Some(lane) = lanes.get_mut(session_id) else {
            return None;
        };
        lane.active = None;
        lane.active_cancel = None;
        let next = if lane.queued.is_empty() { None } else { Some(lane.queued.remove(0)) };
        lane.active = next.clone();
        drop(lanes);

        self.emit(OrchestrationEvent::Completed { session_id: session_id.to_string() });
        if next.is_some() {
            self.emit(OrchestrationEvent::Started { session_id: session_id.to_string() });
        }
        self.persist().await;
        next
    }

    pub async fn register_cancel(&self, session_id: &str, cancel: tokio::sync::oneshot::Sender<()>) {
        let mut lanes = self.lanes.lock().await;
        if let Some(lane) = lanes.get_mut(session_id) {
            lane.active_cancel = Some(cancel);
        }
    }

    async fn persist(&self) {
        let Some(dir) = &self.persist_dir else { return };
        let lanes = self.lanes.lock().await;
        let snapshot = LanesFile {
            version: 1,
            lanes: lanes.iter().map(|(id, lane)| lane.snapshot(id)).collect(),
        };
        drop(lanes);
        let path = dir.join(LANES_FILE);
        let Ok(contents) = serde_json::to_vec_pretty(&snapshot) else { return };
        if let Err(err) = atomic::write(&path, &contents).await {
            warn!(error = %err, "failed to persist orchestration lanes");
        }
    }

    /// Rehydrate persisted lanes on startup, re-submitting entries in
    /// order so queued turns resume.
    pub async fn rehydrate(&self) -> Result<usize, GatewayError> {
        let Some(dir) = &self.persist_dir else { return Ok(0) };
        let path = dir.join(LANES_FILE);
        let contents = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(GatewayError::Io(err.to_string())),
        };
        let file: LanesFile = serde_json::from_slice(&contents)
            .map_err(|err| GatewayError::Io(format!("corrupt orchestration lanes file: {err}")))?;

        let mut restored = 0;
        for snapshot in file.lanes {
            self.ensure_lane(&snapshot.session_id, snapshot.mode, 32, DropPolicy::Old, 400).await;
            if let Some(active) = snapshot.active_input {
                self.submit(&snapshot.session_id, active).await?;
                restored += 1;
            }
            for queued in snapshot.queued_inputs {
                self.submit(&snapshot.session_id, queued).await?;
                restored += 1;
            }
        }
        info!(restored, "rehydrated orchestration lanes");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn input(text: &str) -> TurnInput {
        TurnInput { text: text.to_string(), provider_id: None }
    }

    #[tokio::test]
    async fn queue_mode_applies_old_drop_policy_on_overflow() {
        let (mgr, _rx) = LaneManager::new(None);
        mgr.ensure_lane("s1", LaneMode::Queue, 1, DropPolicy::Old, 0).await;
        assert!(mgr.submit("s1", input("a")).await.unwrap());
        assert!(!mgr.submit("s1", input("b")).await.unwrap());
        assert!(!mgr.submit("s1", input("c")).await.unwrap());

        let lanes = mgr.lanes.lock().await;
        let lane = lanes.get("s1").unwrap();
        assert_eq!(lane.queued.len(), 1);
        assert_eq!(lane.queued[0].text, "c");
    }

    #[tokio::test]
    async fn interrupt_mode_replaces_active_turn() {
        let (mgr, _rx) = LaneManager::new(None);
        mgr.ensure_lane("s1", LaneMode::Interrupt, 10, DropPolicy::New, 0).await;
        assert!(mgr.submit("s1", input("a")).await.unwrap());
        assert!(mgr.submit("s1", input("b")).await.unwrap());

        let lanes = mgr.lanes.lock().await;
        assert_eq!(lanes.get("s1").unwrap().active.as_ref().unwrap().text, "b");
    }

    #[tokio::test]
    async fn summarize_drop_policy_merges_queued_inputs() {
        let (mgr, _rx) = LaneManager::new(None);
        mgr.ensure_lane("s1", LaneMode::Queue, 1, DropPolicy::Summarize, 0).await;
        mgr.submit("s1", input("a")).await.unwrap();
        mgr.submit("s1", input("b")).await.unwrap();
        mgr.submit("s1", input("c")).await.unwrap();

        let lanes = mgr.lanes.lock().await;
        let lane = lanes.get("s1").unwrap();
        assert_eq!(lane.queued.len(), 1);
        assert_eq!(lane.queued[0].text, "b\n---\nc");
    }

    #[tokio::test]
    async fn complete_active_promotes_next_queued() {
        let (mgr, _rx) = LaneManager::new(None);
        mgr.ensure_lane("s1", LaneMode::Queue, 10, DropPolicy::Old, 0).await;
        mgr.submit("s1", input("a")).await.unwrap();
        mgr.submit("s1", input("b")).await.unwrap();

        let next = mgr.complete_active("s1").await;
        assert_eq!(next.unwrap().text, "b");
    }

    #[tokio::test]
    async fn persists_and_rehydrates_lane_state() {
        let dir = TempDir::new().unwrap();
        let (mgr, _rx) = LaneManager::new(Some(dir.path().to_path_buf()));
        mgr.ensure_lane("s1", LaneMode::Queue, 10, DropPolicy::Old, 0).await;
        mgr.submit("s1", input("a")).await.unwrap();
        mgr.submit("s1", input("b")).await.unwrap();

        let (mgr2, _rx2) = LaneManager::new(Some(dir.path().to_path_buf()));
        let restored = mgr2.rehydrate().await.unwrap();
        assert_eq!(restored, 2);
    }
}
