//! `reloadConfig(partial)` — classifies a proposed config patch into fields
//! that can be applied in place and fields that require a restart (§4.8).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dotted field paths that may be changed without a restart. Everything else
/// in a patch is rejected with `restart_required`.
const SAFE_FIELDS: &[&str] = &[
    "log",
    "logLevel",
    "sessionPruneDays",
    "mutationRateLimitPerMinute",
    "maxParallelSubagentJobs",
    "subagentTimeoutMs",
    "security.allowedTools",
    "security.deniedTools",
    "security.deniedPaths",
    "provider",
];

/// Fields that always require a process restart to take effect safely.
const RESTART_REQUIRED_FIELDS: &[&str] = &[
    "workspaceDir",
    "agentEntry",
    "runtimeEntry",
    "sessionDirectory",
    "port",
    "host",
];

#[derive(Debug, Serialize)]
pub struct RejectedField {
    pub path: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ReloadOutcome {
    pub applied: Vec<String>,
    pub restart_required: bool,
    pub rejected: Vec<RejectedField>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigPatch(pub serde_json::Map<String, Value>);

/// Classify and (conceptually) apply a config patch. The caller is
/// responsible for actually mutating the live `HotConfig` for each entry in
/// `applied` — this function only performs the safe/restart_required split
/// so the control plane can respond deterministically.
pub fn classify_patch(patch: &ConfigPatch) -> ReloadOutcome {
    let mut applied = Vec::new();
    let mut rejected = Vec::new();

    for key in patch.0.keys() {
        if RESTART_REQUIRED_FIELDS.contains(&key.as_str()) {
            rejected.push(RejectedField {
                path: key.clone(),
                reason: "restart_required".to_string(),
                message: format!("field '{key}' cannot be changed without a restart"),
            });
        } else if SAFE_FIELDS.iter().any(|f| f == key || key.starts_with(&format!("{f}."))) {
            applied.push(key.clone());
        } else {
            rejected.push(RejectedField {
                path: key.clone(),
                reason: "unknown_field".to_string(),
                message: format!("field '{key}' is not a recognized configuration field"),
            });
        }
    }

    ReloadOutcome {
        applied,
        restart_required: !rejected.is_empty(),
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(json: serde_json::Value) -> ConfigPatch {
        ConfigPatch(json.as_object().unwrap().clone())
    }

    #[test]
    fn safe_fields_apply_cleanly() {
        let p = patch(serde_json::json!({"sessionPruneDays": 14, "log": "debug"}));
        let out = classify_patch(&p);
        assert_eq!(out.applied.len(), 2);
        assert!(!out.restart_required);
        assert!(out.rejected.is_empty());
    }

    #[test]
    fn restart_required_field_is_rejected() {
        let p = patch(serde_json::json!({"workspaceDir": "/tmp/x"}));
        let out = classify_patch(&p);
        assert!(out.restart_required);
        assert_eq!(out.rejected[0].reason, "restart_required");
    }

    #[test]
    fn mixed_patch_applies_safe_and_rejects_unsafe() {
        let p = patch(serde_json::json!({"log": "warn", "port": 9999}));
        let out = classify_patch(&p);
        assert_eq!(out.applied, vec!["log".to_string()]);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].path, "port");
    }
}
