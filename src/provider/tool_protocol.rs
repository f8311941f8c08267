//! Text-based `TOOL_CALL` / `TOOL_RESULT` marker protocol — the fallback
//! used when a provider adapter lacks native function-calling (§4.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TOOL_CALL_MARKER: &str = "TOOL_CALL";
pub const TOOL_RESULT_MARKER: &str = "TOOL_RESULT";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParsedToolCall {
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultPayload {
    pub name: String,
    #[serde(rename = "callId", skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the system-prompt preamble listing available tools and the exact
/// marker syntax the assistant must emit to invoke one.
pub fn build_tool_preamble(tool_names: &[String]) -> String {
    let list = tool_names
        .iter()
        .map(|n| format!("- {n}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You have access to the following tools:\n{list}\n\n\
         To call a tool, emit exactly:\n\
         {TOOL_CALL_MARKER} {{\"name\":\"<tool>\",\"input\":{{...}}}}"
    )
}

/// Attempt to parse a `TOOL_CALL {...}` marker out of an assistant message,
/// unwrapping a fenced code block if present and balance-matching the JSON
/// object so trailing prose after the call does not break parsing.
pub fn parse_tool_call(text: &str) -> Option<ParsedToolCall> {
    let unfenced = strip_code_fence(text);
    let idx = unfenced.find(TOOL_CALL_MARKER)?;
    let after_marker = &unfenced[idx + TOOL_CALL_MARKER.len()..];
    let brace_start = after_marker.find('{')?;
    let json_str = balance_match_json(&after_marker[brace_start..])?;
    serde_json::from_str::<ParsedToolCall>(&json_str).ok()
}

/// Render a `TOOL_RESULT {...}` message body for a completed tool call.
pub fn encode_tool_result_message(payload: &ToolResultPayload) -> String {
    format!(
        "{TOOL_RESULT_MARKER} {}",
        serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
    )
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(stripped) = trimmed.strip_prefix("```") {
        let without_lang = stripped
            .split_once('\n')
            .map(|(_, rest)| rest)
            .unwrap_or(stripped);
        return without_lang.trim_end_matches("```").to_string();
    }
    text.to_string()
}

/// Find the balanced `{...}` substring starting at the first character of
/// `s` (which must already be `{`), tolerating braces inside string
/// literals.
fn balance_match_json(s: &str) -> Option<String> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(s[..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_tool_call() {
        let text = r#"TOOL_CALL {"name":"read_file","input":{"path":"a.txt"}}"#;
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.input["path"], "a.txt");
    }

    #[test]
    fn parses_tool_call_inside_fenced_block() {
        let text = "```\nTOOL_CALL {\"name\":\"shell\",\"input\":{\"cmd\":\"ls\"}}\n```";
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.name, "shell");
    }

    #[test]
    fn ignores_trailing_prose_after_json() {
        let text = r#"TOOL_CALL {"name":"x","input":{}} thanks!"#;
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.name, "x");
    }

    #[test]
    fn returns_none_when_no_marker_present() {
        assert!(parse_tool_call("just a normal reply").is_none());
    }

    #[test]
    fn encodes_successful_result() {
        let payload = ToolResultPayload {
            name: "read_file".to_string(),
            call_id: Some("call-1".to_string()),
            ok: true,
            output: Some(serde_json::json!({"content": "hi"})),
            error: None,
        };
        let encoded = encode_tool_result_message(&payload);
        assert!(encoded.starts_with(TOOL_RESULT_MARKER));
        assert!(encoded.contains("\"ok\":true"));
    }
}
