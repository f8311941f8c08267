//! Restart & Evolution Controller (§4.6): approval gate, restart-budget
//! window, git safety checkpoint, and the `exit(42)` respawn contract.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GatewayError;
use crate::events::EventBus;
use crate::storage::atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartIntent {
    Manual,
    SelfMod,
    ConfigChange,
    Signal,
}

impl RestartIntent {
    fn as_str(self) -> &'static str {
        match self {
            RestartIntent::Manual => "manual",
            RestartIntent::SelfMod => "self_mod",
            RestartIntent::ConfigChange => "config_change",
            RestartIntent::Signal => "signal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RestartHistoryEntry {
    at: DateTime<Utc>,
    intent: RestartIntent,
}

#[derive(Debug, Clone)]
pub struct RestartBudget {
    pub max_restarts: usize,
    pub window: Duration,
    /// Intents this budget governs; an intent outside this set is
    /// unconstrained by this particular budget.
    pub intents: Vec<RestartIntent>,
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self {
            max_restarts: 1,
            window: Duration::hours(1),
            intents: vec![RestartIntent::SelfMod],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartRequest {
    pub intent: RestartIntent,
    pub reason: Option<String>,
    pub session_id: Option<String>,
    pub provider_id: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartOutcome {
    pub ok: bool,
    pub code: &'static str,
}

/// Approval hook consulted before a `self_mod` restart, when
/// `require_approval_for_self_modify` is set.
#[async_trait]
pub trait ApprovalHook: Send + Sync {
    async fn approve(&self, request: &RestartRequest) -> bool;
}

#[derive(Debug, Clone)]
pub struct GitCheckpointResult {
    pub ok: bool,
}

/// Git safety checkpoint: commits or stashes pending work before a restart
/// so a self-modifying agent's changes are never lost mid-restart.
#[async_trait]
pub trait GitCheckpoint: Send + Sync {
    async fn checkpoint(&self) -> GitCheckpointResult;
}

/// Exits the process. Production wiring calls `std::process::exit`; tests
/// substitute a recording stub so the `exit(42)` contract can be asserted
/// without actually terminating the test binary.
pub trait ProcessExit: Send + Sync {
    fn exit(&self, code: i32) -> !;
}

pub struct RealProcessExit;
impl ProcessExit for RealProcessExit {
    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

pub struct RestartPolicy {
    pub require_approval_for_self_modify: bool,
    pub git_checkpoint_enabled: bool,
    pub git_checkpoint_strict: bool,
    pub budget: RestartBudget,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            require_approval_for_self_modify: true,
            git_checkpoint_enabled: true,
            git_checkpoint_strict: false,
            budget: RestartBudget::default(),
        }
    }
}

pub struct RestartController {
    history_path: PathBuf,
    policy: RestartPolicy,
    events: Arc<EventBus>,
}

impl RestartController {
    pub fn new(data_dir: &Path, policy: RestartPolicy, events: Arc<EventBus>) -> Self {
        Self {
            history_path: data_dir.join("restart-history.json"),
            policy,
            events,
        }
    }

    async fn read_history(&self) -> Result<Vec<RestartHistoryEntry>, GatewayError> {
        match tokio::fs::read(&self.history_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::Io(format!("corrupt restart history: {e}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(GatewayError::Io(err.to_string())),
        }
    }

    async fn append_history(&self, intent: RestartIntent) -> Result<(), GatewayError> {
        let mut history = self.read_history().await?;
        history.push(RestartHistoryEntry { at: Utc::now(), intent });
        let bytes = serde_json::to_vec_pretty(&history).map_err(|e| GatewayError::Io(e.to_string()))?;
        atomic::write(&self.history_path, &bytes).await.map_err(|e| GatewayError::Io(e.to_string()))
    }

    async fn count_within_window(&self, intent: RestartIntent, window: Duration) -> Result<usize, GatewayError> {
        let history = self.read_history().await?;
        let cutoff = Utc::now() - window;
        Ok(history.iter().filter(|e| e.intent == intent && e.at >= cutoff).count())
    }

    /// Run the full restart pipeline in order: approval, budget, git
    /// checkpoint, then (unless `dry_run`) actually exit the process.
    pub async fn request_restart(
        &self,
        request: RestartRequest,
        approval: &dyn ApprovalHook,
        checkpoint: &dyn GitCheckpoint,
        exiter: &dyn ProcessExit,
    ) -> Result<RestartOutcome, GatewayError> {
        self.events.emit(
            "gateway.restart.requested",
            json!({"intent": request.intent.as_str(), "reason": request.reason, "dryRun": request.dry_run}),
        );

        if request.intent == RestartIntent::SelfMod && self.policy.require_approval_for_self_modify {
            if !approval.approve(&request).await {
                return Ok(RestartOutcome { ok: false, code: "approval_denied" });
            }
        }

        if self.policy.budget.intents.contains(&request.intent) {
            let count = self
                .count_within_window(request.intent, self.policy.budget.window)
                .await?;
            if count + 1 > self.policy.budget.max_restarts {
                return Ok(RestartOutcome { ok: false, code: "budget_exceeded" });
            }
        }

        if self.policy.git_checkpoint_enabled {
            let result = checkpoint.checkpoint().await;
            if !result.ok && self.policy.git_checkpoint_strict {
                return Ok(RestartOutcome { ok: false, code: "git_checkpoint_failed" });
            }
        }

        self.events.emit("gateway.restart.validated", json!({"intent": request.intent.as_str()}));

        if request.dry_run {
            return Ok(RestartOutcome { ok: true, code: "allowed" });
        }

        self.events.emit("gateway.restart.executing", json!({"intent": request.intent.as_str()}));
        self.append_history(request.intent).await?;
        exiter.exit(42);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use tempfile::TempDir;

    struct AlwaysApprove;
    #[async_trait]
    impl ApprovalHook for AlwaysApprove {
        async fn approve(&self, _request: &RestartRequest) -> bool {
            true
        }
    }

    struct AlwaysDeny;
    #[async_trait]
    impl ApprovalHook for AlwaysDeny {
        async fn approve(&self, _request: &RestartRequest) -> bool {
            false
        }
    }

    struct OkCheckpoint;
    #[async_trait]
    impl GitCheckpoint for OkCheckpoint {
        async fn checkpoint(&self) -> GitCheckpointResult {
            GitCheckpointResult { ok: true }
        }
    }

    struct RecordingExit {
        called_with: AtomicI32,
        called: AtomicBool,
    }
    impl ProcessExit for RecordingExit {
        fn exit(&self, code: i32) -> ! {
            self.called_with.store(code, Ordering::SeqCst);
            self.called.store(true, Ordering::SeqCst);
            panic!("__test_exit_sentinel__");
        }
    }

    fn request(intent: RestartIntent, dry_run: bool) -> RestartRequest {
        RestartRequest { intent, reason: None, session_id: None, provider_id: None, dry_run }
    }

    #[tokio::test]
    async fn dry_run_does_not_charge_budget_and_stays_idempotent() {
        let dir = TempDir::new().unwrap();
        let policy = RestartPolicy {
            require_approval_for_self_modify: false,
            git_checkpoint_enabled: false,
            git_checkpoint_strict: false,
            budget: RestartBudget { max_restarts: 1, window: Duration::hours(1), intents: vec![RestartIntent::SelfMod] },
        };
        let controller = RestartController::new(dir.path(), policy, Arc::new(EventBus::new()));
        let exiter = RecordingExit { called_with: AtomicI32::new(0), called: AtomicBool::new(false) };

        let first = controller
            .request_restart(request(RestartIntent::SelfMod, true), &AlwaysApprove, &OkCheckpoint, &exiter)
            .await
            .unwrap();
        let second = controller
            .request_restart(request(RestartIntent::SelfMod, true), &AlwaysApprove, &OkCheckpoint, &exiter)
            .await
            .unwrap();

        assert_eq!(first.code, "allowed");
        assert_eq!(second.code, "allowed");
        assert!(!exiter.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn self_mod_denied_by_approval_hook_returns_approval_denied() {
        let dir = TempDir::new().unwrap();
        let controller = RestartController::new(dir.path(), RestartPolicy::default(), Arc::new(EventBus::new()));
        let exiter = RecordingExit { called_with: AtomicI32::new(0), called: AtomicBool::new(false) };

        let outcome = controller
            .request_restart(request(RestartIntent::SelfMod, false), &AlwaysDeny, &OkCheckpoint, &exiter)
            .await
            .unwrap();
        assert_eq!(outcome.code, "approval_denied");
        assert!(!exiter.called.load(Ordering::SeqCst));
    }

    /// This test exercises the branch where `request_restart` actually
    /// invokes `exit(42)`. Since `ProcessExit::exit` never returns, the
    /// test stub panics after recording the code, and the assertion runs
    /// inside a spawned task so the panic is observable as a `JoinError`
    /// instead of aborting the test binary.
    #[tokio::test]
    async fn non_dry_run_past_budget_limit_reports_budget_exceeded() {
        let dir = TempDir::new().unwrap();
        let policy = RestartPolicy {
            require_approval_for_self_modify: false,
            git_checkpoint_enabled: false,
            git_checkpoint_strict: false,
            budget: RestartBudget { max_restarts: 1, window: Duration::hours(1), intents: vec![RestartIntent::SelfMod] },
        };
        let controller = Arc::new(RestartController::new(dir.path(), policy, Arc::new(EventBus::new())));
        let exiter = Arc::new(RecordingExit { called_with: AtomicI32::new(0), called: AtomicBool::new(false) });

        let task_controller = controller.clone();
        let task_exiter = exiter.clone();
        let join_result = tokio::spawn(async move {
            task_controller
                .request_restart(request(RestartIntent::SelfMod, false), &AlwaysApprove, &OkCheckpoint, task_exiter.as_ref())
                .await
        })
        .await;

        assert!(join_result.is_err(), "exit(42) should have panicked the spawned task");
        assert!(exiter.called.load(Ordering::SeqCst));
        assert_eq!(exiter.called_with.load(Ordering::SeqCst), 42);

        let second = controller
            .request_restart(request(RestartIntent::SelfMod, false), &AlwaysApprove, &OkCheckpoint, exiter.as_ref())
            .await
            .unwrap();
        assert_eq!(second.code, "budget_exceeded");
    }
}
