use crate::adapter::{get_adapter, AdapterRef, CompletionRequest, OnStreamEvent};
use crate::cancellation::CancelSignal;
use crate::error::AiError;
use crate::providers::ensure_builtin_adapters_registered;
use crate::types::{CompletionOptions, CompletionResponse, Message};

/// Stateless model tables. No retry logic lives here.
const MODEL_TABLE: &[(&str, &str, &[&str])] = &[
    (
        "anthropic",
        "claude-3-5-sonnet-latest",
        &[
            "claude-3-5-sonnet-latest",
            "claude-3-5-haiku-latest",
            "claude-3-opus-latest",
        ],
    ),
    (
        "openai",
        "gpt-4o",
        &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo"],
    ),
    (
        "ollama",
        "llama3.1",
        &["llama3.1", "qwen2.5-coder", "mistral"],
    ),
    (
        "openrouter",
        "anthropic/claude-3.5-sonnet",
        &[
            "anthropic/claude-3.5-sonnet",
            "openai/gpt-4o",
            "meta-llama/llama-3.1-70b-instruct",
        ],
    ),
];

pub fn default_model(provider: &str) -> Option<&'static str> {
    MODEL_TABLE
        .iter()
        .find(|(id, _, _)| *id == provider)
        .map(|(_, default, _)| *default)
}

pub fn available_models(provider: &str) -> Vec<&'static str> {
    MODEL_TABLE
        .iter()
        .find(|(id, _, _)| *id == provider)
        .map(|(_, _, models)| models.to_vec())
        .unwrap_or_default()
}

pub fn known_providers() -> Vec<&'static str> {
    MODEL_TABLE.iter().map(|(id, _, _)| *id).collect()
}

/// Thin facade bound to one provider and key. Construction is cheap and
/// never fails; an unknown provider surfaces at the first call instead.
#[derive(Clone)]
pub struct AiClient {
    provider: String,
    api_key: Option<String>,
}

pub fn create_ai_client(provider: impl Into<String>, api_key: Option<String>) -> AiClient {
    AiClient {
        provider: provider.into(),
        api_key,
    }
}

impl AiClient {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn resolve_adapter(&self) -> Result<AdapterRef, AiError> {
        ensure_builtin_adapters_registered();
        get_adapter(&self.provider).ok_or_else(|| AiError::unsupported_provider(&self.provider))
    }

    fn build_request(
        &self,
        messages: Vec<Message>,
        mut options: CompletionOptions,
        cancel: Option<CancelSignal>,
    ) -> CompletionRequest {
        if options.model.is_empty() {
            if let Some(model) = default_model(&self.provider) {
                options.model = model.to_string();
            }
        }
        let mut request = CompletionRequest::new(messages, options);
        request.api_key = self.api_key.clone();
        request.cancel = cancel;
        request
    }

    pub async fn complete(
        &self,
        messages: Vec<Message>,
        options: CompletionOptions,
        cancel: Option<CancelSignal>,
    ) -> Result<CompletionResponse, AiError> {
        let adapter = self.resolve_adapter()?;
        adapter
            .complete(self.build_request(messages, options, cancel))
            .await
    }

    pub async fn complete_stream(
        &self,
        messages: Vec<Message>,
        options: CompletionOptions,
        on_event: OnStreamEvent,
        cancel: Option<CancelSignal>,
    ) -> Result<CompletionResponse, AiError> {
        let adapter = self.resolve_adapter()?;
        adapter
            .complete_stream(self.build_request(messages, options, cancel), on_event)
            .await
    }
}
