//! Layered gateway configuration.
//!
//! Priority (highest to lowest): CLI/env > `<data_dir>/config.toml` >
//! built-in defaults. Only a small subset of fields (see `HotConfig`) can be
//! changed without a restart; everything else requires a fresh process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub mod reload;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MAX_SESSIONS: usize = 10;
const DEFAULT_SESSION_PRUNE_DAYS: u32 = 30;
const DEFAULT_MUTATION_RATE_LIMIT_PER_MINUTE: u64 = 60;
const DEFAULT_MAX_PARALLEL_SUBAGENT_JOBS: usize = 2;
const DEFAULT_SUBAGENT_TIMEOUT_MS: u64 = 120_000;

/// Per-provider configuration profile, e.g. `[provider.claude]`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderProfileOverride {
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u64>,
    pub system_prompt_prefix: Option<String>,
    pub base_url: Option<String>,
}

/// Tool allow/deny policy, consulted by the path-policy and security layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SecurityConfig {
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub denied_paths: Vec<String>,
}

/// `[control]` table: static bearer tokens for the HTTP control plane's
/// `admin`/`read` scopes (§4.7). Not related to per-provider auth profiles.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ControlConfig {
    #[serde(default)]
    pub admin_tokens: Vec<String>,
    #[serde(default)]
    pub read_tokens: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    host: Option<String>,
    max_sessions: Option<usize>,
    log: Option<String>,
    workspace_dir: Option<PathBuf>,
    session_prune_days: Option<u32>,
    mutation_rate_limit_per_minute: Option<u64>,
    allow_loopback_without_auth: Option<bool>,
    max_parallel_subagent_jobs: Option<usize>,
    subagent_timeout_ms: Option<u64>,
    agent_entry: Option<PathBuf>,
    provider: Option<HashMap<String, ProviderProfileOverride>>,
    #[serde(default)]
    security: SecurityConfig,
    #[serde(default)]
    control: ControlConfig,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Startup-time configuration. Immutable once the gateway is running; a
/// field that needs to change in place lives in `HotConfig` instead.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub host: String,
    pub workspace_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log: String,
    pub max_sessions: usize,
    pub session_prune_days: u32,
    pub mutation_rate_limit_per_minute: u64,
    pub allow_loopback_without_auth: bool,
    pub max_parallel_subagent_jobs: usize,
    pub subagent_timeout_ms: u64,
    pub agent_entry: Option<PathBuf>,
    pub providers: HashMap<String, ProviderProfileOverride>,
    pub security: SecurityConfig,
    pub control: ControlConfig,
}

impl GatewayConfig {
    /// Build config from CLI/env args layered over an optional TOML file.
    pub fn new(
        port: Option<u16>,
        host: Option<String>,
        workspace_dir: PathBuf,
        log: Option<String>,
        max_sessions: Option<usize>,
    ) -> Self {
        let data_dir = workspace_dir.join(".drost");
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let host = host
            .or(toml.host)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let log = log
            .or(toml.log)
            .or_else(|| std::env::var("DROST_LOG").ok())
            .unwrap_or_else(|| "info".to_string());
        let max_sessions = max_sessions
            .or(toml.max_sessions)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        let session_prune_days = toml
            .session_prune_days
            .unwrap_or(DEFAULT_SESSION_PRUNE_DAYS);
        let mutation_rate_limit_per_minute = toml
            .mutation_rate_limit_per_minute
            .unwrap_or(DEFAULT_MUTATION_RATE_LIMIT_PER_MINUTE);
        let allow_loopback_without_auth = toml.allow_loopback_without_auth.unwrap_or(true);
        let max_parallel_subagent_jobs = toml
            .max_parallel_subagent_jobs
            .unwrap_or(DEFAULT_MAX_PARALLEL_SUBAGENT_JOBS);
        let subagent_timeout_ms = toml
            .subagent_timeout_ms
            .unwrap_or(DEFAULT_SUBAGENT_TIMEOUT_MS)
            .max(50);
        let agent_entry = toml.agent_entry.clone();
        let providers = toml.provider.unwrap_or_default();
        let security = toml.security;
        let mut control = toml.control;
        if let Ok(token) = std::env::var("DROST_ADMIN_TOKEN") {
            if !token.is_empty() && !control.admin_tokens.contains(&token) {
                control.admin_tokens.push(token);
            }
        }
        if let Ok(token) = std::env::var("DROST_READ_TOKEN") {
            if !token.is_empty() && !control.read_tokens.contains(&token) {
                control.read_tokens.push(token);
            }
        }
        let workspace_dir = toml.workspace_dir.unwrap_or(workspace_dir);

        Self {
            port,
            host,
            workspace_dir,
            data_dir,
            log,
            max_sessions,
            session_prune_days,
            mutation_rate_limit_per_minute,
            allow_loopback_without_auth,
            max_parallel_subagent_jobs,
            subagent_timeout_ms,
            agent_entry,
            providers,
            security,
            control,
        }
    }

    pub fn session_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn observability_dir(&self) -> PathBuf {
        self.data_dir.join("observability")
    }

    pub fn provider_profile(&self, name: &str) -> Option<&ProviderProfileOverride> {
        self.providers.get(name)
    }
}

// ── Hot-reloadable config subset ────────────────────────────────────────────

/// Fields classified `safe` by §4.8 — reloadable without a restart.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub session_prune_days: u32,
    pub mutation_rate_limit_per_minute: u64,
    pub max_parallel_subagent_jobs: usize,
}

impl HotConfig {
    fn from_toml(toml: &TomlConfig) -> Self {
        Self {
            log_level: toml.log.clone().unwrap_or_else(|| "info".to_string()),
            session_prune_days: toml
                .session_prune_days
                .unwrap_or(DEFAULT_SESSION_PRUNE_DAYS),
            mutation_rate_limit_per_minute: toml
                .mutation_rate_limit_per_minute
                .unwrap_or(DEFAULT_MUTATION_RATE_LIMIT_PER_MINUTE),
            max_parallel_subagent_jobs: toml
                .max_parallel_subagent_jobs
                .unwrap_or(DEFAULT_MAX_PARALLEL_SUBAGENT_JOBS),
        }
    }

    /// Seed the hot-reloadable subset from an already-resolved
    /// [`GatewayConfig`], so the watcher and the runtime agree on the
    /// starting values before the first file-change event ever fires.
    pub fn from_gateway_config(config: &GatewayConfig) -> Self {
        Self {
            log_level: config.log.clone(),
            session_prune_days: config.session_prune_days,
            mutation_rate_limit_per_minute: config.mutation_rate_limit_per_minute,
            max_parallel_subagent_jobs: config.max_parallel_subagent_jobs,
        }
    }
}

fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig::from_toml(&toml)
}

/// Watches `config.toml` for changes and reloads the safe subset in place.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    // Holds the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes, publishing
    /// reloaded values into the caller-owned `hot` handle (shared with
    /// whatever already reads `HotConfig`, e.g. `GatewayRuntime`).
    ///
    /// Returns `None` if the watcher could not be created; the gateway runs
    /// fine without hot-reload in that case (it just degrades quietly).
    pub fn start(data_dir: &Path, hot: Arc<RwLock<HotConfig>>) -> Option<Self> {
        let config_path = data_dir.join("config.toml");

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    use notify_debouncer_full::notify::EventKind;
                    let relevant = events
                        .iter()
                        .any(|e| matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_)));
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.session_prune_days != new_config.session_prune_days
                                || guard.mutation_rate_limit_per_minute
                                    != new_config.mutation_rate_limit_per_minute
                                || guard.max_parallel_subagent_jobs
                                    != new_config.max_parallel_subagent_jobs
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    prune_days = new_config.session_prune_days,
                                    "config.toml reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}
