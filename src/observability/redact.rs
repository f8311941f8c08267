//! Secret redaction for anything persisted to `observability/*.jsonl` or
//! sent over the control-plane SSE stream.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const MAX_STRING_LEN: usize = 8_000;

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"Bearer\s+[A-Za-z0-9._~+/=-]{8,}").unwrap(),
        Regex::new(r"\bsk-[A-Za-z0-9_-]{12,}\b").unwrap(),
        Regex::new(r"\brk-[A-Za-z0-9_-]{12,}\b").unwrap(),
        Regex::new(r"\bgh[pousr]_[A-Za-z0-9]{20,}\b").unwrap(),
        Regex::new(r"\bey[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\b").unwrap(),
    ]
});

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(authorization|cookie|.*token.*|.*secret.*|.*password.*|apikey|api_key)$")
        .unwrap()
});

/// Replace every recognized secret pattern in `s` with `[REDACTED]`.
pub fn redact_str(s: &str) -> String {
    let mut out = s.to_string();
    for pat in SECRET_PATTERNS.iter() {
        out = pat.replace_all(&out, "[REDACTED]").into_owned();
    }
    truncate(&out)
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_STRING_LEN {
        return s.to_string();
    }
    let truncated: String = s.chars().take(MAX_STRING_LEN).collect();
    let dropped = s.chars().count() - MAX_STRING_LEN;
    format!("{truncated}…[truncated {dropped} chars]")
}

/// Recursively redact a JSON value: strings are scanned for secret
/// patterns; object keys matching `SENSITIVE_KEY` are blanked outright
/// regardless of their value's shape.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if SENSITIVE_KEY.is_match(k) {
                    out.insert(k.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(k.clone(), redact_value(v));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_token() {
        let s = "Authorization: Bearer abcdefgh12345678";
        assert!(!redact_str(s).contains("abcdefgh12345678"));
    }

    #[test]
    fn redacts_sk_prefixed_key() {
        let s = "key=sk-abcdefghijklmno1234";
        assert!(!redact_str(s).contains("sk-abcdefghijklmno1234"));
    }

    #[test]
    fn leaves_ordinary_text_untouched() {
        let s = "hello world, this is a normal assistant reply";
        assert_eq!(redact_str(s), s);
    }

    #[test]
    fn redacts_sensitive_object_keys_recursively() {
        let v = serde_json::json!({
            "outer": { "api_key": "sk-shouldnotmatter", "note": "fine" }
        });
        let redacted = redact_value(&v);
        assert_eq!(redacted["outer"]["api_key"], "[REDACTED]");
        assert_eq!(redacted["outer"]["note"], "fine");
    }

    #[test]
    fn truncates_long_strings() {
        let long = "a".repeat(9_000);
        let out = redact_str(&long);
        assert!(out.contains("…[truncated"));
        assert!(out.len() < long.len());
    }
}
