//! Security utilities: path traversal guards, the tool allow/deny policy,
//! and session-id validation for filesystem use.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::config::SecurityConfig;

/// Validate that `relative_path` resolves inside `base_dir` with no
/// traversal, and return the normalized absolute path.
pub fn safe_path(base_dir: &Path, relative_path: &Path) -> Result<PathBuf> {
    if relative_path.is_absolute() {
        bail!("path traversal: absolute path not allowed: {}", relative_path.display());
    }

    let joined = base_dir.join(relative_path);
    let normalized = normalize_path(&joined);

    let base_normalized = normalize_path(base_dir);
    if !normalized.starts_with(&base_normalized) {
        bail!(
            "path traversal: {} escapes base directory {}",
            relative_path.display(),
            base_dir.display()
        );
    }

    Ok(normalized)
}

/// Resolve `.`/`..` components without requiring the path to exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                if matches!(components.last(), Some(Normal(_))) {
                    components.pop();
                }
            }
            CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Check a tool invocation against the configured allow/deny policy.
///
/// 1. `denied_tools` always blocks.
/// 2. A non-empty `allowed_tools` becomes a strict allowlist.
/// 3. For the `bash` tool, a command touching a `denied_paths` entry is
///    blocked regardless of the above.
pub fn check_tool_call(tool_name: &str, tool_input: &str, config: &SecurityConfig) -> Result<()> {
    let tool_lower = tool_name.to_lowercase();

    if config.denied_tools.iter().any(|t| t.to_lowercase() == tool_lower) {
        bail!("tool_denied: '{tool_name}' is in the security.denied_tools list");
    }

    if !config.allowed_tools.is_empty() && !config.allowed_tools.iter().any(|t| t.to_lowercase() == tool_lower) {
        bail!("tool_not_allowed: '{tool_name}' is not in the security.allowed_tools list");
    }

    if tool_lower == "bash" {
        for denied_path in &config.denied_paths {
            let expanded = expand_home(denied_path);
            if tool_input.starts_with(&expanded) || tool_input.contains(&expanded) {
                bail!("tool_path_denied: bash command touches denied path '{denied_path}'");
            }
        }
    }

    Ok(())
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_default();
        if !home.is_empty() {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

/// Redact long base64/hex-alphabet runs (likely API keys or tokens) from
/// tool input before it reaches the audit log.
pub fn sanitize_tool_input(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        let mut j = i;
        while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '+' || chars[j] == '/') {
            j += 1;
        }
        let run = j - i;
        if run >= 40 {
            result.push_str("[REDACTED]");
            i = j;
        } else {
            result.push(chars[i]);
            i += 1;
        }
    }
    result
}

/// Validate a session id for safe use as a filename component: non-empty,
/// bounded length, and free of path separators, `..`, and control
/// characters. Session ids in this gateway are deterministic channel-
/// identity slugs (`drost:telegram:workspace:chat-123`), not UUIDs, so this
/// is a character-class check rather than a fixed-format one.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("invalid_session: session id must not be empty");
    }
    if id.len() > 512 {
        bail!("invalid_session: session id exceeds maximum length of 512");
    }
    if id.contains("..") {
        bail!("invalid_session: session id must not contain '..'");
    }
    for c in id.chars() {
        if c == '/' || c == '\\' || c == '\0' || c.is_control() {
            bail!("invalid_session: session id contains an illegal character");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_path_allows_nested_relative_path() {
        let base = Path::new("/repo");
        let result = safe_path(base, Path::new("src/main.rs")).unwrap();
        assert_eq!(result, PathBuf::from("/repo/src/main.rs"));
    }

    #[test]
    fn safe_path_rejects_traversal_above_base() {
        let base = Path::new("/repo");
        assert!(safe_path(base, Path::new("../../etc/passwd")).is_err());
    }

    #[test]
    fn safe_path_rejects_absolute_input() {
        let base = Path::new("/repo");
        assert!(safe_path(base, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn check_tool_call_blocks_denied_tool() {
        let config = SecurityConfig { denied_tools: vec!["bash".to_string()], allowed_tools: vec![], denied_paths: vec![] };
        assert!(check_tool_call("bash", "ls", &config).is_err());
    }

    #[test]
    fn check_tool_call_enforces_nonempty_allowlist() {
        let config = SecurityConfig { denied_tools: vec![], allowed_tools: vec!["read_file".to_string()], denied_paths: vec![] };
        assert!(check_tool_call("read_file", "a.txt", &config).is_ok());
        assert!(check_tool_call("shell", "ls", &config).is_err());
    }

    #[test]
    fn check_tool_call_blocks_bash_touching_denied_path() {
        let config = SecurityConfig { denied_tools: vec![], allowed_tools: vec![], denied_paths: vec!["/etc".to_string()] };
        assert!(check_tool_call("bash", "cat /etc/shadow", &config).is_err());
    }

    #[test]
    fn sanitize_tool_input_redacts_long_token_runs() {
        let token = "a".repeat(50);
        let input = format!("here is a key: {token}");
        let sanitized = sanitize_tool_input(&input);
        assert!(sanitized.contains("[REDACTED]"));
        assert!(!sanitized.contains(&token));
    }

    #[test]
    fn validate_session_id_rejects_path_separators() {
        assert!(validate_session_id("drost:telegram:global:../etc").is_err());
        assert!(validate_session_id("drost/telegram").is_err());
        assert!(validate_session_id("drost:telegram:global:chat-1").is_ok());
    }
}
