//! Continuity Worker (§4.9): carries a structured summary of a prior
//! session into a freshly created successor session.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::storage::{ChatMessage, Role, SessionStore};

const DEFAULT_SOURCE_MAX_MESSAGES: usize = 400;
const DEFAULT_SOURCE_MAX_CHARS: usize = 120_000;
const DEFAULT_SUMMARY_MAX_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct ContinuityPolicy {
    pub source_max_messages: usize,
    pub source_max_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for ContinuityPolicy {
    fn default() -> Self {
        Self {
            source_max_messages: DEFAULT_SOURCE_MAX_MESSAGES,
            source_max_chars: DEFAULT_SOURCE_MAX_CHARS,
            summary_max_chars: DEFAULT_SUMMARY_MAX_CHARS,
        }
    }
}

/// Bridges a source session's history into a target session as a single
/// prefaced `user` message, run as a best-effort background job — failures
/// are logged and never propagate to the caller that created the session.
pub struct ContinuityWorker {
    store: std::sync::Arc<SessionStore>,
    policy: ContinuityPolicy,
}

impl ContinuityWorker {
    pub fn new(store: std::sync::Arc<SessionStore>, policy: ContinuityPolicy) -> Self {
        Self { store, policy }
    }

    /// Run the continuity job: load both sessions, build the summary, and
    /// append it to the target. Returns `Ok(())` on success; callers that
    /// want job-status tracking should wrap this behind the Subagent
    /// Scheduler rather than awaiting it inline.
    pub async fn carry_over(&self, source_session_id: &str, target_session_id: &str) -> Result<()> {
        let source = match self.store.load_session_record(source_session_id).await? {
            Ok(record) => record,
            Err(diag) => bail!("continuity source session is unreadable: {}", diag.reason),
        };
        let mut target = match self.store.load_session_record(target_session_id).await? {
            Ok(record) => record,
            Err(diag) => bail!("continuity target session is unreadable: {}", diag.reason),
        };

        let filtered = filter_carryable(&source.history, &self.policy);
        let summary = build_summary(&filtered, self.policy.summary_max_chars);

        let message = ChatMessage {
            role: Role::User,
            content: format!(
                "[Session continuity summary from {source_session_id}]\n{summary}\n[End continuity summary]"
            ),
            created_at: Utc::now(),
            image_refs: None,
        };
        target.history.push(message);

        match self.store.save_session_record(target).await {
            Ok(_) => {
                info!(source_session_id, target_session_id, "continuity summary carried over");
                Ok(())
            }
            Err(err) => {
                warn!(source_session_id, target_session_id, error = %err, "continuity carry-over failed to save");
                Err(err)
            }
        }
    }
}

/// Keep only `user`/`assistant`/`tool` messages, then cap by message count
/// (from the oldest) and by total character budget (from the oldest).
fn filter_carryable(history: &[ChatMessage], policy: &ContinuityPolicy) -> Vec<ChatMessage> {
    let mut filtered: Vec<ChatMessage> = history
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .cloned()
        .collect();

    if filtered.len() > policy.source_max_messages {
        let drop = filtered.len() - policy.source_max_messages;
        filtered.drain(0..drop);
    }

    let mut total_chars: usize = filtered.iter().map(|m| m.content.len()).sum();
    while total_chars > policy.source_max_chars && !filtered.is_empty() {
        let removed = filtered.remove(0);
        total_chars = total_chars.saturating_sub(removed.content.len());
    }

    filtered
}

/// Build a structured summary with the four sections the spec names, then
/// hard-cap the result. This is a heuristic extractive summary (no LLM
/// call), good enough to bootstrap continuity without a provider round
/// trip on every `/new`.
fn build_summary(messages: &[ChatMessage], max_chars: usize) -> String {
    let user_turns: Vec<&ChatMessage> = messages.iter().filter(|m| matches!(m.role, Role::User)).collect();
    let assistant_turns: Vec<&ChatMessage> = messages.iter().filter(|m| matches!(m.role, Role::Assistant)).collect();

    let core_objective = user_turns
        .first()
        .map(|m| truncate_chars(&m.content, 400))
        .unwrap_or_else(|| "(no prior user turns)".to_string());

    let decisions = assistant_turns
        .iter()
        .rev()
        .take(3)
        .map(|m| format!("- {}", truncate_chars(&m.content, 200)))
        .collect::<Vec<_>>()
        .join("\n");

    let open_threads = user_turns
        .iter()
        .rev()
        .take(3)
        .map(|m| format!("- {}", truncate_chars(&m.content, 200)))
        .collect::<Vec<_>>()
        .join("\n");

    let timeline_excerpt = messages
        .iter()
        .rev()
        .take(6)
        .rev()
        .map(|m| format!("{:?}: {}", m.role, truncate_chars(&m.content, 160)))
        .collect::<Vec<_>>()
        .join("\n");

    let summary = format!(
        "Core Objective:\n{core_objective}\n\nDecisions:\n{decisions}\n\nOpen Threads:\n{open_threads}\n\nTimeline Excerpt:\n{timeline_excerpt}"
    );
    truncate_chars(&summary, max_chars)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut truncated: String = s.chars().take(max).collect();
    truncated.push('\u{2026}');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc as ChronoUtc;

    fn message(role: Role, content: &str) -> ChatMessage {
        ChatMessage { role, content: content.to_string(), created_at: ChronoUtc::now(), image_refs: None }
    }

    #[test]
    fn filter_carryable_drops_system_messages() {
        let history = vec![
            message(Role::System, "system prompt"),
            message(Role::User, "hello"),
            message(Role::Assistant, "hi there"),
        ];
        let filtered = filter_carryable(&history, &ContinuityPolicy::default());
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|m| !matches!(m.role, Role::System)));
    }

    #[test]
    fn filter_carryable_caps_by_message_count() {
        let mut history = Vec::new();
        for i in 0..10 {
            history.push(message(Role::User, &format!("turn {i}")));
        }
        let policy = ContinuityPolicy { source_max_messages: 3, ..ContinuityPolicy::default() };
        let filtered = filter_carryable(&history, &policy);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[0].content, "turn 7");
    }

    #[test]
    fn build_summary_respects_max_chars() {
        let history = vec![message(Role::User, &"x".repeat(10_000))];
        let summary = build_summary(&history, 100);
        assert!(summary.chars().count() <= 100);
    }

    #[test]
    fn build_summary_includes_all_four_sections() {
        let history = vec![message(Role::User, "objective text"), message(Role::Assistant, "decision text")];
        let summary = build_summary(&history, 4_000);
        assert!(summary.contains("Core Objective:"));
        assert!(summary.contains("Decisions:"));
        assert!(summary.contains("Open Threads:"));
        assert!(summary.contains("Timeline Excerpt:"));
    }
}
