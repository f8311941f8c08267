//! `auth doctor` diagnostic (§10.4), composing the Auth Store, the env
//! fallback, and a lightweight per-provider reachability probe. Mirrors the
//! teacher's `doctor.rs` `CheckResult` / `run_doctor` shape.

use std::collections::HashMap;
use std::time::Duration;

use super::AuthStore;
use crate::config::ProviderProfileOverride;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

/// Run every diagnostic check. `providers` maps a profile name to its
/// override (carrying `base_url`), mirroring `GatewayConfig::providers`.
pub async fn run_doctor(
    auth_store: &AuthStore,
    providers: &HashMap<String, ProviderProfileOverride>,
    probe_timeout: Duration,
) -> Vec<CheckResult> {
    let mut results = Vec::new();
    results.extend(check_profiles_resolve(auth_store).await);
    results.extend(check_provider_auth_references(auth_store, providers).await);
    results.extend(probe_provider_reachability(providers, probe_timeout).await);
    results
}

/// Returns 2 when any check is `Warn` or `Fail`, 0 otherwise — the §10.4
/// exit contract.
pub fn exit_code(results: &[CheckResult]) -> i32 {
    if results.iter().any(|r| r.status != CheckStatus::Pass) {
        2
    } else {
        0
    }
}

async fn check_profiles_resolve(auth_store: &AuthStore) -> Vec<CheckResult> {
    let profiles = auth_store.list().await;
    if profiles.is_empty() {
        return vec![CheckResult {
            name: "auth profiles configured".to_string(),
            status: CheckStatus::Warn,
            detail: "no auth profiles are registered".to_string(),
        }];
    }
    let mut out = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let resolved = auth_store.resolve_bearer_token(&profile.id).await;
        out.push(CheckResult {
            name: format!("profile '{}' resolves a bearer token", profile.id),
            status: if resolved.is_some() { CheckStatus::Pass } else { CheckStatus::Warn },
            detail: if resolved.is_some() {
                format!("{} ({})", profile.provider, profile.id)
            } else {
                format!("{} has no resolvable credential (stored or env-fallback)", profile.id)
            },
        });
    }
    out
}

async fn check_provider_auth_references(
    auth_store: &AuthStore,
    providers: &HashMap<String, ProviderProfileOverride>,
) -> Vec<CheckResult> {
    if providers.is_empty() {
        return Vec::new();
    }
    let profiles = auth_store.list().await;
    let known_ids: std::collections::HashSet<&str> = profiles.iter().map(|p| p.id.as_str()).collect();
    providers
        .keys()
        .map(|name| {
            let resolves = known_ids.contains(name.as_str());
            CheckResult {
                name: format!("provider '{name}' auth profile reference"),
                status: if resolves { CheckStatus::Pass } else { CheckStatus::Warn },
                detail: if resolves {
                    "resolves to a registered auth profile".to_string()
                } else {
                    format!("no auth profile named '{name}' is registered")
                },
            }
        })
        .collect()
}

async fn probe_provider_reachability(
    providers: &HashMap<String, ProviderProfileOverride>,
    timeout: Duration,
) -> Vec<CheckResult> {
    let mut out = Vec::new();
    for (name, profile) in providers {
        let Some(base_url) = &profile.base_url else { continue };
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                out.push(CheckResult {
                    name: format!("provider '{name}' reachability"),
                    status: CheckStatus::Warn,
                    detail: format!("could not build probe client: {e}"),
                });
                continue;
            }
        };
        let result = client.head(base_url.as_str()).send().await;
        out.push(match result {
            Ok(resp) => CheckResult {
                name: format!("provider '{name}' reachability"),
                status: CheckStatus::Pass,
                detail: format!("{base_url} responded with {}", resp.status()),
            },
            Err(e) => CheckResult {
                name: format!("provider '{name}' reachability"),
                status: CheckStatus::Warn,
                detail: format!("{base_url} unreachable: {e}"),
            },
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_zero_when_all_checks_pass() {
        let results = vec![CheckResult {
            name: "x".to_string(),
            status: CheckStatus::Pass,
            detail: "ok".to_string(),
        }];
        assert_eq!(exit_code(&results), 0);
    }

    #[test]
    fn exit_code_is_two_when_any_check_warns() {
        let results = vec![CheckResult {
            name: "x".to_string(),
            status: CheckStatus::Warn,
            detail: "uh oh".to_string(),
        }];
        assert_eq!(exit_code(&results), 2);
    }
}
