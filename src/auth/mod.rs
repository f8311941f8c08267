//! Auth Store & Env Fallback (§4.2).
//!
//! Per the §9 "Global env state" decision, environment resolution does not
//! mutate `std::env` as an implicit cache. `EnvResolver` reads `.env` /
//! `.env.local` once at construction into an owned overlay map and is then
//! threaded explicitly into the Auth Store and Provider Router.

pub mod dotenv;
pub mod doctor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::storage::atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey { value: String },
    Token { value: String },
    Oauth {
        #[serde(rename = "accessToken")]
        access_token: String,
        #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
        account_id: Option<String>,
        #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
}

impl Credential {
    fn bearer_value(&self) -> &str {
        match self {
            Credential::ApiKey { value } => value,
            Credential::Token { value } => value,
            Credential::Oauth { access_token, .. } => access_token,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub credential: Credential,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Snapshot of env vars relevant to auth resolution, read once at startup
/// from the real process environment layered under `.env`/`.env.local`.
pub struct EnvResolver {
    overlay: HashMap<String, String>,
}

impl EnvResolver {
    /// Build a resolver for `cwd` and `project_root`, loading `.env` and
    /// `.env.local` from both without ever overwriting a variable already
    /// present in the process environment.
    pub fn load(cwd: &std::path::Path, project_root: Option<&std::path::Path>) -> Self {
        let mut overlay = HashMap::new();
        for dir in [Some(cwd), project_root].into_iter().flatten() {
            for name in [".env", ".env.local"] {
                let path = dir.join(name);
                if let Ok(contents) = std::fs::read_to_string(&path) {
                    for (k, v) in dotenv::parse(&contents) {
                        overlay.entry(k).or_insert(v);
                    }
                }
            }
        }
        Self { overlay }
    }

    /// Resolve a variable: process env takes priority, then the `.env`
    /// overlay, matching "never overwrite a variable already defined in
    /// the process environment".
    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.overlay.get(key).cloned())
    }
}

fn provider_kind_hint(id_or_kind: &str) -> &'static str {
    let lower = id_or_kind.to_lowercase();
    if lower.contains("anthropic") || lower.contains("claude") {
        "anthropic"
    } else if lower.contains("xai") || lower.contains("grok") {
        "xai"
    } else {
        "unknown"
    }
}

pub struct AuthStore {
    path: PathBuf,
    profiles: RwLock<HashMap<String, AuthProfile>>,
    env: Arc<EnvResolver>,
}

impl AuthStore {
    pub async fn load(path: PathBuf, env: Arc<EnvResolver>) -> Result<Self> {
        let profiles = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<HashMap<String, AuthProfile>>(&raw)
                .context("failed to parse auth-profiles.json")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            profiles: RwLock::new(profiles),
            env,
        })
    }

    pub async fn upsert(&self, profile: AuthProfile) -> Result<()> {
        let mut guard = self.profiles.write().await;
        guard.insert(profile.id.clone(), profile);
        self.persist(&guard).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut guard = self.profiles.write().await;
        guard.remove(id);
        self.persist(&guard).await
    }

    async fn persist(&self, profiles: &HashMap<String, AuthProfile>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(profiles)?;
        atomic::write(&self.path, &body).await
    }

    pub async fn list(&self) -> Vec<AuthProfile> {
        self.profiles.read().await.values().cloned().collect()
    }

    /// Resolve a bearer token for `profile_id`, falling back to the
    /// recognized environment variables when no stored credential exists.
    pub async fn resolve_bearer_token(&self, profile_id: &str) -> Option<String> {
        if let Some(profile) = self.profiles.read().await.get(profile_id) {
            return Some(profile.credential.bearer_value().to_string());
        }

        match provider_kind_hint(profile_id) {
            "anthropic" => self
                .env
                .get("ANTHROPIC_SETUP_TOKEN")
                .or_else(|| self.env.get("ANTHROPIC_API_KEY")),
            "xai" => self.env.get("XAI_API_KEY"),
            _ => None,
        }
        .inspect(|_| debug!(profile_id, "resolved bearer token via env fallback"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn env_fallback_resolves_anthropic_profile() {
        std::env::set_var("ANTHROPIC_API_KEY", "test-key-123");
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvResolver::load(dir.path(), None));
        let store = AuthStore::load(dir.path().join("auth-profiles.json"), env)
            .await
            .unwrap();
        let token = store.resolve_bearer_token("anthropic-default").await;
        assert_eq!(token.as_deref(), Some("test-key-123"));
        std::env::remove_var("ANTHROPIC_API_KEY");
    }

    #[tokio::test]
    async fn stored_profile_takes_priority_over_env() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvResolver::load(dir.path(), None));
        let store = AuthStore::load(dir.path().join("auth-profiles.json"), env)
            .await
            .unwrap();
        store
            .upsert(AuthProfile {
                id: "anthropic-default".to_string(),
                provider: "anthropic".to_string(),
                credential: Credential::ApiKey {
                    value: "stored-value".to_string(),
                },
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let token = store.resolve_bearer_token("anthropic-default").await;
        assert_eq!(token.as_deref(), Some("stored-value"));
    }

    #[tokio::test]
    async fn unknown_profile_without_env_resolves_to_none() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvResolver::load(dir.path(), None));
        let store = AuthStore::load(dir.path().join("auth-profiles.json"), env)
            .await
            .unwrap();
        assert!(store.resolve_bearer_token("mystery-provider").await.is_none());
    }
}
