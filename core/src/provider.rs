//! Provider Registry (§4.4): named backends with model lists and a
//! request/response contract.
//!
//! Grounded on `core/src/agent/contract/runtime.rs`'s `LLMProvider` trait
//! (`async_trait`-based) and on `core/src/hub.rs`'s model-listing HTTP shape
//! for the `OpenAiCompatibleProvider`. Retry/backoff for `RateLimited`/
//! `Timeout` lives in the Message Router (§4.7), not here — the provider
//! only surfaces the raw outcome, mirroring the separation of concerns in
//! `core/src/agent/runtime/impls/retry.rs` (`RetryLLM` wraps rather than
//! mutates an inner capability).

use crate::error::{HubError, Result};
use crate::ids::ProviderId;
use crate::types::ProviderRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub deadline: Duration,
    /// Caller-supplied token making `complete` idempotent with respect to
    /// network retry (§4.4); absent means the provider may have side
    /// effects such as usage counters on a retried call.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub body: String,
    pub tokens_consumed: u32,
    pub finish_reason: String,
    pub latency: Duration,
}

/// An adapter to a remote or local model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &ProviderId;

    async fn list_models(&self) -> Result<Vec<String>>;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// A deterministic in-memory provider for tests and demos. Scripted
/// responses are consumed in order; once exhausted, the configured
/// `failure` (if any) is returned.
pub struct MockProvider {
    id: ProviderId,
    models: Vec<String>,
    scripted_responses: RwLock<std::collections::VecDeque<std::result::Result<String, HubError>>>,
}

impl MockProvider {
    pub fn new(id: impl Into<ProviderId>, models: Vec<String>) -> Self {
        Self {
            id: id.into(),
            models,
            scripted_responses: RwLock::new(std::collections::VecDeque::new()),
        }
    }

    pub async fn push_response(&self, body: impl Into<String>) {
        self.scripted_responses.write().await.push_back(Ok(body.into()));
    }

    pub async fn push_failure(&self, error: HubError) {
        self.scripted_responses.write().await.push_back(Err(error));
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self.models.clone())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        if !self.models.contains(&request.model) {
            return Err(HubError::InvalidArgument {
                message: format!("model {} not registered with provider {}", request.model, self.id),
            });
        }
        let next = self.scripted_responses.write().await.pop_front();
        match next {
            Some(Ok(body)) => Ok(CompletionResponse {
                tokens_consumed: body.len() as u32,
                body,
                finish_reason: "stop".into(),
                latency: Duration::from_millis(1),
            }),
            Some(Err(e)) => Err(e),
            None => Ok(CompletionResponse {
                body: format!("mock reply to: {}", request.messages.last().map(|m| m.content.as_str()).unwrap_or("")),
                tokens_consumed: 8,
                finish_reason: "stop".into(),
                latency: Duration::from_millis(1),
            }),
        }
    }
}

/// HTTP provider for OpenAI-compatible chat-completions endpoints, grounded
/// on `core/src/hub.rs`'s `fetch_models`/request-building shape.
pub struct OpenAiCompatibleProvider {
    id: ProviderId,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: impl Into<ProviderId>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| HubError::TransportFailure { message: e.to_string() })?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(HubError::AuthFailure { message: "provider rejected credentials".into() });
        }
        let parsed: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| HubError::SchemaFailure { message: e.to_string() })?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        #[derive(Serialize)]
        struct WireRequest<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            max_tokens: u32,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChatMessage,
            finish_reason: String,
        }
        #[derive(Deserialize)]
        struct Usage {
            total_tokens: u32,
        }
        #[derive(Deserialize)]
        struct WireResponse {
            choices: Vec<Choice>,
            usage: Usage,
        }

        let started = std::time::Instant::now();
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(request.deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HubError::Timeout { duration: request.deadline }
                } else {
                    HubError::TransportFailure { message: e.to_string() }
                }
            })?;

        match resp.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                return Err(HubError::AuthFailure { message: "provider rejected credentials".into() })
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(HubError::RateLimited { message: "provider asked to back off".into() })
            }
            status if status.as_u16() == 413 => {
                return Err(HubError::ContextExceeded {
                    max_tokens: request.max_tokens as usize,
                    used_tokens: request.messages.iter().map(|m| m.content.len()).sum(),
                })
            }
            status if !status.is_success() => {
                return Err(HubError::TransportFailure { message: format!("status {}", status) })
            }
            _ => {}
        }

        let parsed: WireResponse = resp
            .json()
            .await
            .map_err(|e| HubError::SchemaFailure { message: e.to_string() })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| HubError::SchemaFailure { message: "empty choices array".into() })?;
        Ok(CompletionResponse {
            body: choice.message.content,
            tokens_consumed: parsed.usage.total_tokens,
            finish_reason: choice.finish_reason,
            latency: started.elapsed(),
        })
    }
}

/// Registers named providers and validates request targets against the
/// registered {providerId, modelId} pairs (§4.4).
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderId, (ProviderRecord, Arc<dyn Provider>)>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, record: ProviderRecord, provider: Arc<dyn Provider>) {
        let id = record.id.clone();
        self.providers.write().await.insert(id, (record, provider));
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<Arc<dyn Provider>> {
        self.providers
            .read()
            .await
            .get(provider_id)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| HubError::NotFound { what: format!("provider {}", provider_id) })
    }

    pub async fn validate_target(&self, provider_id: &ProviderId, model_id: &str) -> Result<()> {
        let providers = self.providers.read().await;
        let (record, _) = providers
            .get(provider_id)
            .ok_or_else(|| HubError::NotFound { what: format!("provider {}", provider_id) })?;
        if !record.models.iter().any(|m| m == model_id) {
            return Err(HubError::InvalidArgument {
                message: format!("model {} not registered with provider {}", model_id, provider_id),
            });
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<ProviderRecord> {
        self.providers.read().await.values().map(|(r, _)| r.clone()).collect()
    }
}
