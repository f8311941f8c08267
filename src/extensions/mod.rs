//! Extension contract for dynamically-loaded capability (§9 "Dynamically
//! loaded agent/plugin modules").
//!
//! The source this gateway is modeled on loads project-local JavaScript at
//! runtime and calls into it directly. That has no honest equivalent in a
//! statically-typed binary, so this module defines the three capability
//! seams a plugin can fill — tools, channels, hooks — as trait objects a
//! host registers ahead of time. A real deployment satisfies these either
//! with pre-registered built-ins, a `cdylib` loaded through a known symbol,
//! or a subprocess speaking an IPC protocol; this crate only defines the
//! seam and the first-wins collision rule, not a code-loading mechanism.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::orchestration::TurnInput;
use crate::provider::router::ToolExecutor;

/// A single callable tool (built-in, plugin-contributed, or agent-defined).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    async fn call(&self, input: Value) -> Result<Value, String>;
}

/// A channel adapter bridges an external surface (terminal, messaging
/// service) into the gateway's turn-submission path. `channel_id` is the
/// discriminator used by `resolve_channel_session_id` (§3).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_id(&self) -> &str;
    async fn connect(&self) -> Result<(), String>;
    async fn disconnect(&self);
}

/// Lifecycle hooks a plugin or loaded agent can register around a turn.
#[async_trait]
pub trait TurnHooks: Send + Sync {
    async fn before_turn(&self, _session_id: &str, _input: &TurnInput) -> Result<(), String> {
        Ok(())
    }
    async fn after_turn(&self, _session_id: &str, _assistant_text: &str) {}
    async fn on_tool_result(&self, _session_id: &str, _tool_name: &str, _result: &Result<Value, String>) {}
}

/// Provenance of a registered tool, used only to break name collisions in
/// first-wins order and to explain a `degradedReasons` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolOrigin {
    BuiltIn,
    Plugin,
    Agent,
}

/// Merges built-in, plugin, and agent-contributed tools into one namespace.
/// Registration is first-wins: a later source offering a name already
/// claimed is rejected and recorded as a degraded reason rather than
/// silently shadowing the earlier tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: std::collections::HashMap<String, (ToolOrigin, std::sync::Arc<dyn Tool>)>,
    degraded_reasons: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` from `origin`. Sources must be registered in
    /// priority order (built-ins first) for "first-wins" to hold.
    pub fn register(&mut self, origin: ToolOrigin, tool: std::sync::Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Some((existing_origin, _)) = self.tools.get(&name) {
            let reason = format!(
                "tool_name_collision: '{name}' from {origin:?} shadowed by existing {existing_origin:?} registration"
            );
            warn!("{reason}");
            self.degraded_reasons.push(reason);
            return;
        }
        self.tools.insert(name, (origin, tool));
    }

    pub fn degraded_reasons(&self) -> &[String] {
        &self.degraded_reasons
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub async fn call(&self, name: &str, input: Value) -> Result<Value, String> {
        match self.tools.get(name) {
            Some((_, tool)) => tool.call(input).await,
            None => Err(format!("unknown tool: {name}")),
        }
    }
}

/// Bridges [`ToolRegistry`] into the Provider Router's narrower
/// [`ToolExecutor`] seam so the tool-call loop doesn't need to know about
/// origins or collision bookkeeping.
#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, input: Value) -> Result<Value, String> {
        self.call(name, input).await
    }

    fn tool_names(&self) -> Vec<String> {
        self.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool(&'static str);
    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.0
        }
        async fn call(&self, input: Value) -> Result<Value, String> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn first_registration_wins_on_name_collision() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolOrigin::BuiltIn, std::sync::Arc::new(EchoTool("echo")));
        registry.register(ToolOrigin::Plugin, std::sync::Arc::new(EchoTool("echo")));

        assert_eq!(registry.names(), vec!["echo".to_string()]);
        assert_eq!(registry.degraded_reasons().len(), 1);
        assert!(registry.degraded_reasons()[0].contains("tool_name_collision"));
    }

    #[tokio::test]
    async fn call_dispatches_to_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolOrigin::BuiltIn, std::sync::Arc::new(EchoTool("echo")));
        let result = registry.call("echo", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result["x"], 1);
    }

    #[tokio::test]
    async fn call_unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        assert!(registry.call("missing", Value::Null).await.is_err());
    }
}
