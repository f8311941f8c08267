//! Candidate-chain construction and the failover loop that drives
//! [`ProviderAdapter`] calls, plus the tool-call loop that sits on top of a
//! single turn (§4.3).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::GatewayError;

use super::merge::merge_stream_text;
use super::rate_limits::{CooldownTracker, FailureClass};
use super::retry::{backoff_sleep, RetryConfig};
use super::tool_protocol::{
    build_tool_preamble, encode_tool_result_message, parse_tool_call, ToolResultPayload,
};
use super::{AdapterError, ProviderAdapter, ProviderKind, ProviderProfile, ProviderRoute, StreamEvent, TurnRequest};

/// Caps how many `TOOL_CALL` round-trips a single user turn may take before
/// the Router gives up and returns whatever text it has.
const MAX_TOOL_ITERATIONS: u32 = 8;

/// Resolves the fallback chain a config file contributes after a route's
/// own primary/fallback list, plus the per-class cooldown overrides.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub extra_chain: Vec<String>,
    pub max_retries: usize,
    pub failover_enabled: bool,
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            extra_chain: Vec::new(),
            max_retries: 3,
            failover_enabled: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Something that can execute a tool by name, used to satisfy `TOOL_CALL`
/// markers parsed out of assistant text.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: Value) -> Result<Value, String>;
    fn tool_names(&self) -> Vec<String>;
}

/// Resolves the bearer token to send for a given auth profile id.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, auth_profile_id: &str) -> Option<String>;
}

/// Builds `[primary, ...route.fallbacks, ...config.chain]`, deduplicated in
/// first-seen order.
pub fn build_candidate_chain(route: &ProviderRoute, extra_chain: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut chain = Vec::new();
    for id in std::iter::once(route.primary_provider_id.clone())
        .chain(route.fallback_provider_ids.iter().cloned())
        .chain(extra_chain.iter().cloned())
    {
        if seen.insert(id.clone()) {
            chain.push(id);
        }
    }
    chain
}

/// Splits a candidate chain into (not-in-cooldown, in-cooldown) order and
/// truncates to `max(1, max_retries)` total candidates.
async fn select_candidates(
    chain: Vec<String>,
    cooldowns: &CooldownTracker,
    max_retries: usize,
) -> Vec<String> {
    let mut ready = Vec::new();
    let mut cooling = Vec::new();
    for id in chain {
        if cooldowns.is_in_cooldown(&id).await {
            cooling.push(id);
        } else {
            ready.push(id);
        }
    }
    ready.extend(cooling);
    let limit = max_retries.max(1);
    ready.truncate(limit);
    ready
}

pub struct Router {
    profiles: HashMap<String, ProviderProfile>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    cooldowns: CooldownTracker,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        profiles: HashMap<String, ProviderProfile>,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            profiles,
            adapters,
            cooldowns: CooldownTracker::new(),
            config,
        }
    }

    fn profile_kind_label(&self, profile: &ProviderProfile) -> &'static str {
        match profile.kind {
            ProviderKind::Openai => "openai",
            ProviderKind::OpenaiCompatible => "openai-compatible",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenaiCodex => "openai-codex",
        }
    }

    /// Run one accumulator-merged turn against the candidate chain for
    /// `route`, without the tool-call loop. Returns the final assistant
    /// text.
    pub async fn run_turn(
        &self,
        route: &ProviderRoute,
        tokens: &dyn TokenResolver,
        request: &TurnRequest,
        emit: &(dyn Fn(StreamEvent) + Send + Sync),
    ) -> Result<String, GatewayError> {
        let chain = build_candidate_chain(route, &self.config.extra_chain);
        let candidates = select_candidates(chain, &self.cooldowns, self.config.max_retries).await;
        if candidates.is_empty() {
            return Err(GatewayError::NotFound("no provider candidates configured".into()));
        }

        let mut last_err: Option<GatewayError> = None;

        for (idx, provider_id) in candidates.iter().enumerate() {
            let attempt = (idx + 1) as u32;
            let Some(profile) = self.profiles.get(provider_id) else {
                warn!(provider_id, "candidate has no configured profile, skipping");
                continue;
            };
            let Some(adapter) = self.adapters.get(&profile.adapter_id) else {
                warn!(adapter_id = %profile.adapter_id, "no adapter registered, skipping candidate");
                continue;
            };
            let bearer = tokens.resolve(&profile.auth_profile_id).await;

            let accumulator = std::sync::Mutex::new(String::new());
            let wrapped_emit = |event: StreamEvent| {
                match event {
                    StreamEvent::ResponseDelta { text } => {
                        let mut acc = accumulator.lock().expect("accumulator mutex poisoned");
                        *acc = merge_stream_text(&acc, &text);
                        emit(StreamEvent::ResponseDelta { text: acc.clone() });
                    }
                    other => emit(other),
                }
            };

            match adapter.run_turn(profile, bearer.as_deref(), request, &wrapped_emit).await {
                Ok(()) => {
                    self.cooldowns.clear(provider_id).await;
                    let final_text = accumulator.into_inner().expect("accumulator mutex poisoned");
                    emit(StreamEvent::ResponseCompleted { text: final_text.clone() });
                    info!(provider_id, kind = self.profile_kind_label(profile), "turn completed");
                    return Ok(final_text);
                }
                Err(adapter_err) => {
                    let class = FailureClass::classify(adapter_err.status, &adapter_err.message);
                    self.cooldowns.record_failure(provider_id, class).await;
                    emit(StreamEvent::ProviderError {
                        provider_id: provider_id.clone(),
                        class: failure_class_label(class),
                        attempt,
                        message: adapter_err.message.clone(),
                    });

                    let retryable = self.config.failover_enabled && class.retryable();
                    last_err = Some(adapter_error_to_gateway(&adapter_err, class));
                    if !retryable {
                        return Err(last_err.expect("set above"));
                    }
                    if idx + 1 < candidates.len() {
                        backoff_sleep(&self.config.retry, attempt).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::NotFound("all provider candidates exhausted".into())))
    }

    /// Run a turn with the text-based tool-call loop layered on top:
    /// injects the tool preamble, parses `TOOL_CALL` markers out of the
    /// assistant's reply, executes them, and loops until the assistant
    /// replies without issuing a tool call or the iteration cap is hit.
    pub async fn run_turn_with_tools(
        &self,
        route: &ProviderRoute,
        tokens: &dyn TokenResolver,
        mut request: TurnRequest,
        tools: &dyn ToolExecutor,
        emit: &(dyn Fn(StreamEvent) + Send + Sync),
    ) -> Result<String, GatewayError> {
        let tool_names = tools.tool_names();
        if !tool_names.is_empty() && !request.tool_names.contains(&"__preamble_injected".to_string()) {
            let preamble = build_tool_preamble(&tool_names);
            request.messages.insert(0, json!({"role": "system", "content": preamble}));
            request.tool_names.push("__preamble_injected".to_string());
        }

        for _ in 0..MAX_TOOL_ITERATIONS {
            let text = self.run_turn(route, tokens, &request, emit).await?;

            let Some(call) = parse_tool_call(&text) else {
                return Ok(text);
            };

            request.messages.push(json!({"role": "assistant", "content": text}));

            let result_payload = match tools.execute(&call.name, call.input.clone()).await {
                Ok(output) => ToolResultPayload {
                    name: call.name.clone(),
                    call_id: None,
                    ok: true,
                    output: Some(output),
                    error: None,
                },
                Err(message) => ToolResultPayload {
                    name: call.name.clone(),
                    call_id: None,
                    ok: false,
                    output: None,
                    error: Some(message),
                },
            };
            let tool_message = encode_tool_result_message(&result_payload);
            request.messages.push(json!({"role": "tool", "content": tool_message}));
        }

        Err(GatewayError::Validation {
            message: "exceeded maximum tool-call iterations for a single turn".into(),
            issues: Vec::new(),
        })
    }
}

fn failure_class_label(class: FailureClass) -> &'static str {
    match class {
        FailureClass::Auth => "auth",
        FailureClass::Permission => "permission",
        FailureClass::RateLimit => "rate_limit",
        FailureClass::ServerError => "server_error",
        FailureClass::FatalRequest => "fatal_request",
        FailureClass::Timeout => "timeout",
        FailureClass::Network => "network",
    }
}

fn adapter_error_to_gateway(err: &AdapterError, class: FailureClass) -> GatewayError {
    match class {
        FailureClass::FatalRequest => GatewayError::Validation {
            message: err.message.clone(),
            issues: Vec::new(),
        },
        _ => GatewayError::Io(err.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn profile(id: &str, adapter_id: &str) -> ProviderProfile {
        ProviderProfile {
            id: id.to_string(),
            adapter_id: adapter_id.to_string(),
            kind: ProviderKind::OpenaiCompatible,
            base_url: None,
            model: "test-model".to_string(),
            auth_profile_id: "auth-1".to_string(),
            capability_hints: None,
            wire_quirks: None,
        }
    }

    struct StaticTokens;
    #[async_trait]
    impl TokenResolver for StaticTokens {
        async fn resolve(&self, _auth_profile_id: &str) -> Option<String> {
            Some("tok".to_string())
        }
    }

    struct FlakyAdapter {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        async fn run_turn(
            &self,
            _profile: &ProviderProfile,
            _bearer_token: Option<&str>,
            _request: &TurnRequest,
            emit: &(dyn Fn(StreamEvent) + Send + Sync),
        ) -> Result<(), AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(AdapterError {
                    status: Some(503),
                    message: "upstream unavailable".to_string(),
                    retry_after: None,
                });
            }
            emit(StreamEvent::ResponseDelta { text: "hello".to_string() });
            emit(StreamEvent::ResponseDelta { text: "hello world".to_string() });
            Ok(())
        }
    }

    struct FatalAdapter;
    #[async_trait]
    impl ProviderAdapter for FatalAdapter {
        async fn run_turn(
            &self,
            _profile: &ProviderProfile,
            _bearer_token: Option<&str>,
            _request: &TurnRequest,
            _emit: &(dyn Fn(StreamEvent) + Send + Sync),
        ) -> Result<(), AdapterError> {
            Err(AdapterError {
                status: Some(400),
                message: "bad request".to_string(),
                retry_after: None,
            })
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            session_id: "s1".to_string(),
            messages: vec![json!({"role": "user", "content": "hi"})],
            tool_names: Vec::new(),
        }
    }

    #[test]
    fn candidate_chain_dedupes_preserving_order() {
        let route = ProviderRoute {
            id: "r1".to_string(),
            primary_provider_id: "a".to_string(),
            fallback_provider_ids: vec!["b".to_string(), "a".to_string()],
        };
        let chain = build_candidate_chain(&route, &["c".to_string(), "b".to_string()]);
        assert_eq!(chain, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn run_turn_fails_over_to_next_candidate_on_server_error() {
        let mut profiles = HashMap::new();
        profiles.insert("p1".to_string(), profile("p1", "flaky"));
        profiles.insert("p2".to_string(), profile("p2", "flaky-ok"));

        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            "flaky".to_string(),
            Arc::new(FlakyAdapter { fail_times: 99, calls: AtomicUsize::new(0) }),
        );
        adapters.insert(
            "flaky-ok".to_string(),
            Arc::new(FlakyAdapter { fail_times: 0, calls: AtomicUsize::new(0) }),
        );

        let router = Router::new(
            profiles,
            adapters,
            RouterConfig { retry: RetryConfig { retry_delay_ms: 1, backoff_multiplier: 1.0, max_retries: 3 }, ..Default::default() },
        );
        let route = ProviderRoute {
            id: "r1".to_string(),
            primary_provider_id: "p1".to_string(),
            fallback_provider_ids: vec!["p2".to_string()],
        };

        let result = router
            .run_turn(&route, &StaticTokens, &request(), &|_| {})
            .await
            .unwrap();
        assert_eq!(result, "hello world");
    }

    #[tokio::test]
    async fn fatal_request_does_not_fail_over() {
        let mut profiles = HashMap::new();
        profiles.insert("p1".to_string(), profile("p1", "fatal"));
        profiles.insert("p2".to_string(), profile("p2", "flaky-ok"));
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("fatal".to_string(), Arc::new(FatalAdapter));
        adapters.insert(
            "flaky-ok".to_string(),
            Arc::new(FlakyAdapter { fail_times: 0, calls: AtomicUsize::new(0) }),
        );
        let router = Router::new(profiles, adapters, RouterConfig::default());
        let route = ProviderRoute {
            id: "r1".to_string(),
            primary_provider_id: "p1".to_string(),
            fallback_provider_ids: vec!["p2".to_string()],
        };

        let err = router
            .run_turn(&route, &StaticTokens, &request(), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    struct EchoTool;
    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, name: &str, input: Value) -> Result<Value, String> {
            Ok(json!({"name": name, "echo": input}))
        }
        fn tool_names(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }
    }

    struct ToolCallingAdapter {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl ProviderAdapter for ToolCallingAdapter {
        async fn run_turn(
            &self,
            _profile: &ProviderProfile,
            _bearer_token: Option<&str>,
            _request: &TurnRequest,
            emit: &(dyn Fn(StreamEvent) + Send + Sync),
        ) -> Result<(), AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = if n == 0 {
                r#"TOOL_CALL {"name":"echo","input":{"x":1}}"#.to_string()
            } else {
                "final answer".to_string()
            };
            emit(StreamEvent::ResponseDelta { text });
            Ok(())
        }
    }

    #[tokio::test]
    async fn tool_call_loop_executes_and_continues() {
        let mut profiles = HashMap::new();
        profiles.insert("p1".to_string(), profile("p1", "toolcall"));
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("toolcall".to_string(), Arc::new(ToolCallingAdapter { calls: AtomicUsize::new(0) }));
        let router = Router::new(profiles, adapters, RouterConfig::default());
        let route = ProviderRoute {
            id: "r1".to_string(),
            primary_provider_id: "p1".to_string(),
            fallback_provider_ids: vec![],
        };

        let result = router
            .run_turn_with_tools(&route, &StaticTokens, request(), &EchoTool, &|_| {})
            .await
            .unwrap();
        assert_eq!(result, "final answer");
    }
}
