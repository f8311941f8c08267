//! `drost` — self-hostable conversational-agent gateway daemon.
//!
//! CLI surface (§6): `init`, `migrate runtime`, `start`, `restart`,
//! `auth {list,doctor,codex-import,set-api-key,set-token,set-setup-token}`,
//! `providers {list,probe}`, `tool {list-templates,new}`, `completions`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drost::auth::{doctor, AuthProfile, AuthStore, Credential, EnvResolver};
use drost::config::GatewayConfig;
use drost::control::{self, ControlState};
use drost::gateway::GatewayRuntime;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "drost", about = "Drost — self-hostable conversational-agent gateway", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Control-plane HTTP port (0 = OS-chosen).
    #[arg(long, env = "DROST_PORT", global = true)]
    port: Option<u16>,

    /// Workspace root (sessions, config, and the `.drost/` data dir live under here).
    #[arg(long, env = "DROST_PROJECT_ROOT", global = true)]
    workspace_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "DROST_LOG", global = true)]
    log: Option<String>,

    /// Maximum concurrent sessions.
    #[arg(long, global = true)]
    max_sessions: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a new workspace.
    ///
    /// Creates `<name>/.drost/` with a default `config.toml`. Safe to
    /// re-run: existing files are never overwritten.
    ///
    /// Examples:
    ///   drost init my-project
    Init {
        /// Directory to create and initialize.
        name: PathBuf,
    },
    /// Migrate a runtime/agent entry point into this workspace's config.
    ///
    /// Examples:
    ///   drost migrate runtime ./agent/index.js
    ///   drost migrate runtime
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Start the gateway in the foreground.
    ///
    /// Binds the control plane, runs the resource-governor preflight,
    /// recovers in-flight subagent jobs, and serves until SIGINT/SIGTERM.
    ///
    /// Examples:
    ///   drost start
    ///   drost start --ui plain
    Start {
        /// Console UI mode: plain output, an interactive TUI, or auto-detect.
        #[arg(long, value_enum, default_value = "auto")]
        ui: UiMode,
    },
    /// Request a restart through the Restart & Evolution Controller.
    ///
    /// Runs the full approval/budget/git-checkpoint pipeline and exits 42
    /// on success so a process supervisor can respawn the gateway.
    ///
    /// Examples:
    ///   drost restart
    ///   drost restart --dry-run
    Restart {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Manage stored provider credentials.
    ///
    /// Examples:
    ///   drost auth list
    ///   drost auth doctor
    ///   drost auth set-api-key anthropic anthropic-default sk-ant-...
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Inspect configured provider profiles.
    ///
    /// Examples:
    ///   drost providers list
    ///   drost providers probe 5000
    Providers {
        #[command(subcommand)]
        action: ProvidersAction,
    },
    /// Scaffold or list tool templates for plugin/agent development.
    ///
    /// Examples:
    ///   drost tool list-templates
    ///   drost tool new my-tool --template http
    Tool {
        #[command(subcommand)]
        action: ToolAction,
    },
    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   drost completions zsh > _drost
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum UiMode {
    Plain,
    Tui,
    Auto,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Point the workspace config at an agent entry file.
    Runtime {
        /// Path to the agent/runtime entry point. Omit to clear it.
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// List registered auth profiles (credential material is never printed).
    List,
    /// Run auth diagnostics; exits 2 if any check is not a clean pass.
    Doctor,
    /// Import an auth profile from a Codex-style `auth.json`.
    CodexImport {
        id: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Store a provider API key.
    SetApiKey { provider: String, id: String, key: String },
    /// Store a provider bearer token.
    SetToken { provider: String, id: String, token: String },
    /// Store an Anthropic setup token.
    SetSetupToken { id: Option<String>, token: String },
}

#[derive(Subcommand)]
enum ProvidersAction {
    /// List configured provider profiles.
    List,
    /// Probe each provider's base URL for reachability.
    Probe { timeout_ms: Option<u64> },
}

#[derive(Subcommand)]
enum ToolAction {
    /// List the built-in tool scaffold templates.
    ListTemplates,
    /// Scaffold a new tool module from a template.
    New {
        name: String,
        #[arg(long, default_value = "basic")]
        template: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let workspace_dir = args
        .workspace_dir
        .clone()
        .unwrap_or(std::env::current_dir().context("failed to resolve current directory")?);

    let command = args.command.unwrap_or(Command::Start { ui: UiMode::Auto });

    let log_directive = args.log.clone().unwrap_or_else(|| "info".to_string());
    let data_dir = workspace_dir.join(".drost");
    tokio::fs::create_dir_all(&data_dir).await.ok();
    let _log_guard = drost::observability::init_tracing(&log_directive, &data_dir).ok();

    match command {
        Command::Init { name } => cmd_init(&name).await,
        Command::Migrate { action } => cmd_migrate(&workspace_dir, args.log.clone(), args.max_sessions, args.port, action).await,
        Command::Start { ui } => cmd_start(workspace_dir, args.port, args.log, args.max_sessions, ui).await,
        Command::Restart { dry_run, reason } => cmd_restart(&workspace_dir, dry_run, reason).await,
        Command::Auth { action } => cmd_auth(&workspace_dir, action).await,
        Command::Providers { action } => cmd_providers(&workspace_dir, args.port, args.log, args.max_sessions, action).await,
        Command::Tool { action } => cmd_tool(action),
        Command::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
    }
}

async fn cmd_init(name: &PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(name).await?;
    let data_dir = name.join(".drost");
    tokio::fs::create_dir_all(&data_dir).await?;
    let config_path = data_dir.join("config.toml");
    if !config_path.exists() {
        let default_toml = "# drost workspace configuration\nport = 4300\nhost = \"127.0.0.1\"\n";
        tokio::fs::write(&config_path, default_toml).await?;
        println!("initialized workspace at {}", name.display());
    } else {
        println!("{} already initialized", name.display());
    }
    Ok(())
}

async fn cmd_migrate(
    workspace_dir: &PathBuf,
    log: Option<String>,
    max_sessions: Option<usize>,
    port: Option<u16>,
    action: MigrateAction,
) -> Result<()> {
    let MigrateAction::Runtime { path } = action;
    let config = GatewayConfig::new(port, None, workspace_dir.clone(), log, max_sessions);
    let config_path = config.data_dir.join("config.toml");
    let mut doc: toml::Value = match tokio::fs::read_to_string(&config_path).await {
        Ok(raw) => raw.parse()?,
        Err(_) => toml::Value::Table(Default::default()),
    };
    let table = doc.as_table_mut().context("config.toml is not a table")?;
    match &path {
        Some(p) => {
            table.insert("agent_entry".to_string(), toml::Value::String(p.display().to_string()));
            println!("set agentEntry to {}", p.display());
        }
        None => {
            table.remove("agent_entry");
            println!("cleared agentEntry");
        }
    }
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::write(&config_path, toml::to_string_pretty(&doc)?).await?;
    Ok(())
}

async fn bootstrap_runtime(
    workspace_dir: PathBuf,
    port: Option<u16>,
    log: Option<String>,
    max_sessions: Option<usize>,
) -> Result<Arc<GatewayRuntime>> {
    let config = GatewayConfig::new(port, None, workspace_dir, log, max_sessions);
    GatewayRuntime::bootstrap(config).await
}

async fn cmd_start(
    workspace_dir: PathBuf,
    port: Option<u16>,
    log: Option<String>,
    max_sessions: Option<usize>,
    ui: UiMode,
) -> Result<()> {
    let _ = ui; // TUI/plain rendering is a presentation detail layered over the same runtime.
    let runtime = bootstrap_runtime(workspace_dir, port, log, max_sessions).await?;
    runtime.start().await?;

    let control_state = ControlState::new(runtime.clone());
    let addr = control::serve(control_state, &runtime.config.host, runtime.config.port).await?;
    runtime.set_control_addr(addr).await;
    info!(addr = %addr, "control plane listening");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping gateway");
    runtime.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_restart(workspace_dir: &PathBuf, dry_run: bool, reason: Option<String>) -> Result<()> {
    let config = GatewayConfig::new(None, None, workspace_dir.clone(), None, None);
    let events = Arc::new(drost::events::EventBus::new());
    let controller = drost::restart::RestartController::new(&config.data_dir, drost::restart::RestartPolicy::default(), events);

    struct CliApprove;
    #[async_trait::async_trait]
    impl drost::restart::ApprovalHook for CliApprove {
        async fn approve(&self, _request: &drost::restart::RestartRequest) -> bool {
            true
        }
    }
    struct CliCheckpoint {
        workspace_dir: PathBuf,
    }
    #[async_trait::async_trait]
    impl drost::restart::GitCheckpoint for CliCheckpoint {
        async fn checkpoint(&self) -> drost::restart::GitCheckpointResult {
            match git2::Repository::discover(&self.workspace_dir) {
                Ok(repo) => {
                    let ok = repo.statuses(None).is_ok();
                    drost::restart::GitCheckpointResult { ok }
                }
                Err(_) => drost::restart::GitCheckpointResult { ok: true },
            }
        }
    }

    let request = drost::restart::RestartRequest {
        intent: drost::restart::RestartIntent::Manual,
        reason,
        session_id: None,
        provider_id: None,
        dry_run,
    };
    let outcome = controller
        .request_restart(
            request,
            &CliApprove,
            &CliCheckpoint { workspace_dir: workspace_dir.clone() },
            &drost::restart::RealProcessExit,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_auth(workspace_dir: &PathBuf, action: AuthAction) -> Result<()> {
    let config = GatewayConfig::new(None, None, workspace_dir.clone(), None, None);
    let env = Arc::new(EnvResolver::load(workspace_dir, Some(workspace_dir)));
    let store = AuthStore::load(config.data_dir.join("auth-profiles.json"), env).await?;

    match action {
        AuthAction::List => {
            for profile in store.list().await {
                println!("{}\t{}", profile.id, profile.provider);
            }
        }
        AuthAction::Doctor => {
            let results = doctor::run_doctor(&store, &config.providers, std::time::Duration::from_secs(20)).await;
            for r in &results {
                let mark = match r.status {
                    doctor::CheckStatus::Pass => "pass",
                    doctor::CheckStatus::Warn => "warn",
                    doctor::CheckStatus::Fail => "fail",
                };
                println!("[{mark}] {} — {}", r.name, r.detail);
            }
            let code = doctor::exit_code(&results);
            if code != 0 {
                std::process::exit(code);
            }
        }
        AuthAction::CodexImport { id, path } => {
            let path = path.unwrap_or_else(|| {
                std::env::var("DROST_CODEX_AUTH_JSON")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        std::env::var("CODEX_HOME")
                            .map(|h| PathBuf::from(h).join("auth.json"))
                            .unwrap_or_else(|_| PathBuf::from("auth.json"))
                    })
            });
            let raw = tokio::fs::read_to_string(&path).await.context("failed to read codex auth.json")?;
            let parsed: serde_json::Value = serde_json::from_str(&raw)?;
            let token = parsed
                .get("OPENAI_API_KEY")
                .or_else(|| parsed.get("tokens").and_then(|t| t.get("access_token")))
                .and_then(|v| v.as_str())
                .context("no recognizable credential field in codex auth.json")?
                .to_string();
            let id = id.unwrap_or_else(|| "openai-codex".to_string());
            store
                .upsert(AuthProfile {
                    id: id.clone(),
                    provider: "openai-codex".to_string(),
                    credential: Credential::Token { value: token },
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                })
                .await?;
            println!("imported codex credential as profile '{id}'");
        }
        AuthAction::SetApiKey { provider, id, key } => {
            store
                .upsert(AuthProfile {
                    id: id.clone(),
                    provider,
                    credential: Credential::ApiKey { value: key },
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                })
                .await?;
            println!("stored api key for profile '{id}'");
        }
        AuthAction::SetToken { provider, id, token } => {
            store
                .upsert(AuthProfile {
                    id: id.clone(),
                    provider,
                    credential: Credential::Token { value: token },
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                })
                .await?;
            println!("stored token for profile '{id}'");
        }
        AuthAction::SetSetupToken { id, token } => {
            let id = id.unwrap_or_else(|| "anthropic-default".to_string());
            store
                .upsert(AuthProfile {
                    id: id.clone(),
                    provider: "anthropic".to_string(),
                    credential: Credential::Token { value: token },
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                })
                .await?;
            println!("stored setup token for profile '{id}'");
        }
    }
    Ok(())
}

async fn cmd_providers(
    workspace_dir: &PathBuf,
    port: Option<u16>,
    log: Option<String>,
    max_sessions: Option<usize>,
    action: ProvidersAction,
) -> Result<()> {
    let config = GatewayConfig::new(port, None, workspace_dir.clone(), log, max_sessions);
    match action {
        ProvidersAction::List => {
            for (name, profile) in &config.providers {
                println!("{name}\t{}", profile.base_url.clone().unwrap_or_default());
            }
        }
        ProvidersAction::Probe { timeout_ms } => {
            let env = Arc::new(EnvResolver::load(workspace_dir, Some(workspace_dir)));
            let store = AuthStore::load(config.data_dir.join("auth-profiles.json"), env).await?;
            let timeout = std::time::Duration::from_millis(timeout_ms.unwrap_or(20_000));
            let results = doctor::run_doctor(&store, &config.providers, timeout).await;
            for r in results.iter().filter(|r| r.name.contains("reachability")) {
                println!("{}: {}", r.name, r.detail);
            }
        }
    }
    Ok(())
}

fn cmd_tool(action: ToolAction) -> Result<()> {
    match action {
        ToolAction::ListTemplates => {
            for t in ["basic", "http", "shell", "file"] {
                println!("{t}");
            }
        }
        ToolAction::New { name, template } => {
            warn!(name, template, "tool scaffolding writes a template file into the current directory");
            let contents = format!(
                "//! {name} — generated from the '{template}' tool template.\n\nuse async_trait::async_trait;\nuse serde_json::Value;\nuse drost::extensions::Tool;\n\npub struct {name_camel};\n\n#[async_trait]\nimpl Tool for {name_camel} {{\n    fn name(&self) -> &str {{ \"{name}\" }}\n\n    async fn call(&self, input: Value) -> Result<Value, String> {{\n        Ok(input)\n    }}\n}}\n",
                name = name,
                template = template,
                name_camel = to_camel_case(&name),
            );
            let path = PathBuf::from(format!("{name}.rs"));
            std::fs::write(&path, contents)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

fn to_camel_case(name: &str) -> String {
    name.split(|c: char| c == '-' || c == '_')
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn cmd_completions(shell: clap_complete::Shell) {
    let mut cmd = <Args as clap::CommandFactory>::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}
