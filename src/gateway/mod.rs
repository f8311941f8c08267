//! Gateway Runtime Composer (§4.8): owns the `stopped -> running|degraded
//! -> stopping -> stopped` lifecycle and wires every other component
//! (session store, auth store, provider router, orchestration lanes,
//! subagent scheduler, restart controller, continuity worker,
//! observability sinks) into one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auth::{AuthStore, EnvResolver};
use crate::backup::BackupManager;
use crate::config::reload::{classify_patch, ConfigPatch, ReloadOutcome};
use crate::config::{ConfigWatcher, GatewayConfig, HotConfig};
use crate::continuity::{ContinuityPolicy, ContinuityWorker};
use crate::events::EventBus;
use crate::extensions::{ChannelAdapter, ToolOrigin, ToolRegistry};
use crate::observability::ObservabilitySink;
use crate::orchestration::LaneManager;
use crate::resource_governor::{self, ResourceGovernorConfig};
use crate::restart::{RestartController, RestartPolicy};
use crate::storage::SessionStore;
use crate::subagent::SubagentScheduler;

/// The coarse lifecycle phase. `degraded` is represented separately as a
/// non-empty `degraded_reasons` list layered on top of `Running`, per §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayPhase {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatusSnapshot {
    pub status: &'static str,
    #[serde(rename = "degradedReasons")]
    pub degraded_reasons: Vec<String>,
    #[serde(rename = "controlUrl", skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
    #[serde(rename = "toolNames")]
    pub tool_names: Vec<String>,
    #[serde(rename = "activeSessions")]
    pub active_sessions: usize,
}

/// Everything the Gateway Runtime owns, assembled once at `bootstrap` and
/// shared (via `Arc`) with the control plane and channel adapters.
pub struct GatewayRuntime {
    pub config: GatewayConfig,
    pub events: Arc<EventBus>,
    pub session_store: Arc<SessionStore>,
    pub auth_store: Arc<AuthStore>,
    pub env: Arc<EnvResolver>,
    pub lanes: Arc<LaneManager>,
    pub subagents: Arc<SubagentScheduler>,
    pub restart: Arc<RestartController>,
    pub continuity: Arc<ContinuityWorker>,
    pub observability: Arc<ObservabilitySink>,
    pub tools: Arc<RwLock<ToolRegistry>>,
    pub backup: Arc<BackupManager>,
    /// Live view of the §4.8 "safe" config subset; `reload_config` and the
    /// `config.toml` file watcher both write through this handle, and
    /// request-path readers (session prune days, mutation rate limit, ...)
    /// should prefer it over the immutable `config` snapshot.
    pub hot_config: Arc<RwLock<HotConfig>>,
    config_watcher: RwLock<Option<ConfigWatcher>>,
    phase: Arc<RwLock<GatewayPhase>>,
    degraded_reasons: Arc<RwLock<Vec<String>>>,
    control_addr: Arc<RwLock<Option<SocketAddr>>>,
    channels: RwLock<Vec<Arc<dyn ChannelAdapter>>>,
}

impl GatewayRuntime {
    /// Construct every component from `config` without starting anything
    /// observable (no servers bound, no preflight run). Split from `start`
    /// so tests can build a runtime and inspect it without binding ports.
    pub async fn bootstrap(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let events = Arc::new(EventBus::new());
        let session_store = Arc::new(SessionStore::new(config.session_dir()).await?);
        let env = Arc::new(EnvResolver::load(&config.workspace_dir, Some(&config.workspace_dir)));
        let auth_store = Arc::new(
            AuthStore::load(config.data_dir.join("auth-profiles.json"), env.clone()).await?,
        );
        let observability = Arc::new(ObservabilitySink::new(config.observability_dir()).await?);
        let (lanes, mut lane_events) = LaneManager::new(Some(config.data_dir.clone()));
        let lanes = Arc::new(lanes);
        let subagents = Arc::new(SubagentScheduler::new(
            config.data_dir.join("subagents"),
            config.max_parallel_subagent_jobs,
        ));
        let restart = Arc::new(RestartController::new(
            &config.data_dir,
            RestartPolicy::default(),
            events.clone(),
        ));
        let continuity = Arc::new(ContinuityWorker::new(
            session_store.clone(),
            ContinuityPolicy::default(),
        ));
        let backup = Arc::new(BackupManager::new(config.data_dir.clone()));
        let hot_config = Arc::new(RwLock::new(HotConfig::from_gateway_config(&config)));

        // Forward orchestration lane events onto the shared event bus so
        // the control plane's SSE stream sees `orchestration.*` alongside
        // `gateway.*` and `provider.*` events.
        let forwarded_events = events.clone();
        tokio::spawn(async move {
            while let Some(event) = lane_events.recv().await {
                let name = match &event {
                    crate::orchestration::OrchestrationEvent::Submitted { .. } => "orchestration.submitted",
                    crate::orchestration::OrchestrationEvent::Started { .. } => "orchestration.started",
                    crate::orchestration::OrchestrationEvent::Completed { .. } => "orchestration.completed",
                    crate::orchestration::OrchestrationEvent::Dropped { .. } => "orchestration.dropped",
                };
                forwarded_events.emit(name, json!(event));
            }
        });

        Ok(Arc::new(Self {
            config,
            events,
            session_store,
            auth_store,
            env,
            lanes,
            subagents,
            restart,
            continuity,
            observability,
            tools: Arc::new(RwLock::new(ToolRegistry::new())),
            backup,
            hot_config,
            config_watcher: RwLock::new(None),
            phase: Arc::new(RwLock::new(GatewayPhase::Stopped)),
            degraded_reasons: Arc::new(RwLock::new(Vec::new())),
            control_addr: Arc::new(RwLock::new(None)),
            channels: RwLock::new(Vec::new()),
        }))
    }

    /// Register a built-in/plugin/agent tool before calling `start` — after
    /// start, the registry is still mutable but newly added tools won't
    /// retroactively clear a collision degraded reason from an earlier run.
    pub async fn register_tool(&self, origin: ToolOrigin, tool: Arc<dyn crate::extensions::Tool>) {
        self.tools.write().await.register(origin, tool);
    }

    pub async fn register_channel(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.channels.write().await.push(adapter);
    }

    fn record_degraded(reasons: &mut Vec<String>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "gateway entering degraded state");
        reasons.push(reason);
    }

    /// Run the §4.8 startup sequence. Every individual failure degrades
    /// rather than aborts — only a session-store construction failure
    /// (already handled in `bootstrap`) is fatal.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.events.emit("gateway.starting", json!({}));

        let mut reasons = Vec::new();

        let preflight = resource_governor::run_preflight(
            &self.config.workspace_dir,
            &self.config.session_dir(),
            &ResourceGovernorConfig::default(),
        );
        reasons.extend(preflight);

        {
            let registry = self.tools.read().await;
            reasons.extend(registry.degraded_reasons().iter().cloned());
        }

        if let Err(err) = self.subagents.recover().await {
            Self::record_degraded(&mut reasons, format!("subagent_recovery_failed: {err}"));
        }

        if let Some(agent_entry) = &self.config.agent_entry {
            if !agent_entry.exists() {
                Self::record_degraded(
                    &mut reasons,
                    format!("agent_entry_not_found: {}", agent_entry.display()),
                );
            }
        }

        {
            let channels = self.channels.read().await;
            for channel in channels.iter() {
                if let Err(err) = channel.connect().await {
                    Self::record_degraded(
                        &mut reasons,
                        format!("channel_connect_failed: {} — {err}", channel.channel_id()),
                    );
                }
            }
        }

        if let Err(err) = self.lanes.rehydrate().await {
            Self::record_degraded(&mut reasons, format!("lane_rehydrate_failed: {err}"));
        }

        // Hot-reload is a best-effort convenience, not a correctness
        // requirement (`reload_config` still works via the control plane
        // without it) — a watcher that fails to start (e.g. inotify limits)
        // does not degrade the gateway, only loses the file-triggered path.
        if let Some(watcher) = ConfigWatcher::start(&self.config.data_dir, self.hot_config.clone()) {
            *self.config_watcher.write().await = Some(watcher);
        }

        *self.degraded_reasons.write().await = reasons;
        *self.phase.write().await = GatewayPhase::Running;

        self.events.emit(
            "gateway.started",
            json!({"degraded": !self.degraded_reasons.read().await.is_empty()}),
        );
        info!(
            degraded = !self.degraded_reasons.read().await.is_empty(),
            "gateway started"
        );
        Ok(())
    }

    /// Record the bound control-plane address once the HTTP server binds,
    /// so `/status` can report the resolved URL (relevant when `port: 0`
    /// asked for an OS-chosen port).
    pub async fn set_control_addr(&self, addr: SocketAddr) {
        *self.control_addr.write().await = Some(addr);
    }

    /// §5 "Gateway stop()": abort active turns (best-effort — lanes whose
    /// adapter does not return within the §9 200 ms interrupt budget are
    /// abandoned, not awaited), disconnect channels, flip to `Stopped`.
    pub async fn stop(&self) {
        *self.phase.write().await = GatewayPhase::Stopping;
        self.events.emit("gateway.stopping", json!({}));

        let channels = self.channels.read().await;
        for channel in channels.iter() {
            channel.disconnect().await;
        }
        drop(channels);

        *self.phase.write().await = GatewayPhase::Stopped;
        self.events.emit("gateway.stopped", json!({}));
    }

    /// `reloadConfig(partial)` — apply the safe subset of `patch` in place,
    /// reject the rest with `restartRequired: true` (§4.8).
    pub async fn reload_config(&self, patch: ConfigPatch) -> ReloadOutcome {
        let outcome = classify_patch(&patch);
        if !outcome.applied.is_empty() {
            let mut hot = self.hot_config.write().await;
            for field in &outcome.applied {
                match field.as_str() {
                    "log" | "logLevel" => {
                        if let Some(v) = patch.0.get(field).and_then(|v| v.as_str()) {
                            hot.log_level = v.to_string();
                        }
                    }
                    "sessionPruneDays" => {
                        if let Some(v) = patch.0.get(field).and_then(|v| v.as_u64()) {
                            hot.session_prune_days = v as u32;
                        }
                    }
                    "mutationRateLimitPerMinute" => {
                        if let Some(v) = patch.0.get(field).and_then(|v| v.as_u64()) {
                            hot.mutation_rate_limit_per_minute = v;
                        }
                    }
                    "maxParallelSubagentJobs" => {
                        if let Some(v) = patch.0.get(field).and_then(|v| v.as_u64()) {
                            hot.max_parallel_subagent_jobs = v as usize;
                        }
                    }
                    // Provider overrides and the security allow/deny lists are
                    // applied by the fields that consult `GatewayConfig`
                    // directly at call time (tool policy, provider profile
                    // lookup) — nothing to mirror into `HotConfig` for them.
                    _ => {}
                }
            }
            drop(hot);
            info!(fields = ?outcome.applied, "applied hot config reload");
        }
        outcome
    }

    pub async fn status(&self) -> GatewayStatusSnapshot {
        let phase = *self.phase.read().await;
        let reasons = self.degraded_reasons.read().await.clone();
        let status = match (phase, reasons.is_empty()) {
            (GatewayPhase::Running, true) => "running",
            (GatewayPhase::Running, false) => "degraded",
            (GatewayPhase::Stopping, _) => "stopping",
            (GatewayPhase::Stopped, _) => "stopped",
        };
        let control_url = self
            .control_addr
            .read()
            .await
            .map(|addr| format!("http://{addr}"));
        let tool_names = self.tools.read().await.names();
        let active_sessions = self
            .session_store
            .list_index()
            .await
            .map(|entries| entries.len())
            .unwrap_or(0);

        GatewayStatusSnapshot {
            status,
            degraded_reasons: reasons,
            control_url,
            tool_names,
            active_sessions,
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.config.workspace_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn runtime(dir: &TempDir) -> Arc<GatewayRuntime> {
        let config = GatewayConfig::new(Some(0), None, dir.path().to_path_buf(), Some("error".into()), None);
        GatewayRuntime::bootstrap(config).await.unwrap()
    }

    #[tokio::test]
    async fn starts_running_with_no_degraded_reasons_in_a_clean_workspace() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir).await;
        rt.start().await.unwrap();

        let status = rt.status().await;
        assert_eq!(status.status, "running");
        assert!(status.degraded_reasons.is_empty());
    }

    #[tokio::test]
    async fn missing_agent_entry_degrades_instead_of_aborting() {
        let dir = TempDir::new().unwrap();
        let mut config = GatewayConfig::new(Some(0), None, dir.path().to_path_buf(), Some("error".into()), None);
        config.agent_entry = Some(dir.path().join("does-not-exist.js"));
        let rt = GatewayRuntime::bootstrap(config).await.unwrap();
        rt.start().await.unwrap();

        let status = rt.status().await;
        assert_eq!(status.status, "degraded");
        assert!(status.degraded_reasons.iter().any(|r| r.starts_with("agent_entry_not_found")));
    }

    #[tokio::test]
    async fn stop_transitions_back_to_stopped() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir).await;
        rt.start().await.unwrap();
        rt.stop().await;

        assert_eq!(rt.status().await.status, "stopped");
    }
}
