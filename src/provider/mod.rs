//! Provider Router & Failover (§4.3): candidate-chain construction,
//! streaming-delta merge, failure classification, cooldown-aware failover,
//! and the text-based tool-call protocol.

pub mod merge;
pub mod rate_limits;
pub mod retry;
pub mod router;
pub mod tool_protocol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire family a provider adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Openai,
    OpenaiCompatible,
    Anthropic,
    OpenaiCodex,
}

/// A configured provider endpoint (§3 "Provider profile").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    #[serde(rename = "adapterId")]
    pub adapter_id: String,
    pub kind: ProviderKind,
    #[serde(rename = "baseUrl", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(rename = "authProfileId")]
    pub auth_profile_id: String,
    #[serde(rename = "capabilityHints", skip_serializing_if = "Option::is_none")]
    pub capability_hints: Option<Value>,
    #[serde(rename = "wireQuirks", skip_serializing_if = "Option::is_none")]
    pub wire_quirks: Option<Value>,
}

/// A session's provider routing policy: primary plus ordered fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRoute {
    pub id: String,
    #[serde(rename = "primaryProviderId")]
    pub primary_provider_id: String,
    #[serde(rename = "fallbackProviderIds", default)]
    pub fallback_provider_ids: Vec<String>,
}

/// One turn submitted to a provider adapter.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub messages: Vec<Value>,
    pub tool_names: Vec<String>,
}

/// Stream events an adapter emits back through its `emit` callback, and the
/// Router re-emits (after merging deltas) to downstream consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "response.delta")]
    ResponseDelta { text: String },
    #[serde(rename = "usage.updated")]
    UsageUpdated { input_tokens: u64, output_tokens: u64 },
    #[serde(rename = "response.completed")]
    ResponseCompleted { text: String },
    #[serde(rename = "provider.error")]
    ProviderError {
        #[serde(rename = "providerId")]
        provider_id: String,
        class: &'static str,
        attempt: u32,
        message: String,
    },
}

/// An adapter failure, carrying enough context for the Router to classify
/// and decide whether to fail over.
#[derive(Debug, Clone)]
pub struct AdapterError {
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<std::time::Duration>,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Implemented once per wire family (OpenAI, OpenAI-compatible, Anthropic,
/// OpenAI Codex). `run_turn` streams `StreamEvent`s to `emit` as they
/// arrive and resolves once the turn completes or fails.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn run_turn(
        &self,
        profile: &ProviderProfile,
        bearer_token: Option<&str>,
        request: &TurnRequest,
        emit: &(dyn Fn(StreamEvent) + Send + Sync),
    ) -> Result<(), AdapterError>;
}
