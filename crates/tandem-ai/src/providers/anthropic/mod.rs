mod parser;
mod payload;

use std::sync::Arc;

use tracing::debug;

use self::parser::{parse_message_body, AnthropicStream};
use self::payload::build_anthropic_payload;
use crate::adapter::{
    AdapterFuture, AdapterRef, CompletionAdapter, CompletionRequest, OnStreamEvent,
};
use crate::error::{AiError, AiErrorCode};
use crate::providers::common::{
    http_error, join_url, race_cancel, shared_http_client, transport_error, SseFramer,
};
use crate::types::CompletionResponse;

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

pub(crate) struct AnthropicAdapter {
    provider: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub(crate) fn new(provider: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            base_url: base_url.into(),
        }
    }
}

impl CompletionAdapter for AnthropicAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn complete(&self, request: CompletionRequest) -> AdapterFuture {
        let provider = self.provider.clone();
        let base_url = self.base_url.clone();
        Box::pin(async move { run_complete(provider, base_url, request).await })
    }

    fn complete_stream(
        &self,
        request: CompletionRequest,
        on_event: OnStreamEvent,
    ) -> AdapterFuture {
        let provider = self.provider.clone();
        let base_url = self.base_url.clone();
        Box::pin(async move { run_stream(provider, base_url, request, on_event).await })
    }
}

pub(crate) fn adapter() -> AdapterRef {
    Arc::new(AnthropicAdapter::new(
        "anthropic",
        DEFAULT_BASE_URL.to_string(),
    ))
}

fn resolve_api_key(provider: &str, request: &CompletionRequest) -> Result<String, AiError> {
    match request.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => Ok(key.to_string()),
        _ => Err(AiError::new(
            AiErrorCode::AuthMissing,
            format!("Missing API key for provider '{provider}'"),
        )),
    }
}

async fn send_request(
    provider: &str,
    base_url: &str,
    request: &CompletionRequest,
    stream: bool,
) -> Result<reqwest::Response, AiError> {
    let api_key = resolve_api_key(provider, request)?;
    let payload = build_anthropic_payload(&request.messages, &request.options, stream);
    let endpoint = join_url(base_url, "messages");
    let client = shared_http_client(base_url);

    debug!(
        provider,
        model = request.options.model.as_str(),
        stream,
        "sending anthropic completion request"
    );

    let mut builder = client
        .post(endpoint.as_str())
        .header("x-api-key", api_key.as_str())
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json");

    if let Some(headers) = &request.extra_headers {
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
    }

    let cancel = request.cancel.clone();
    let response = race_cancel(cancel.as_ref(), builder.json(&payload).send())
        .await?
        .map_err(|error| transport_error(provider, error))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = race_cancel(cancel.as_ref(), response.text())
            .await?
            .unwrap_or_else(|_| "unable to read error body".to_string());
        return Err(http_error(provider, status, &body));
    }
    Ok(response)
}

async fn run_complete(
    provider: String,
    base_url: String,
    request: CompletionRequest,
) -> Result<CompletionResponse, AiError> {
    let cancel = request.cancel.clone();
    let fallback_model = request.options.model.clone();
    let response = send_request(&provider, &base_url, &request, false).await?;
    let body = race_cancel(cancel.as_ref(), response.text())
        .await?
        .map_err(|error| transport_error(&provider, error))?;
    parse_message_body(&body, &fallback_model, None)
}

async fn run_stream(
    provider: String,
    base_url: String,
    request: CompletionRequest,
    on_event: OnStreamEvent,
) -> Result<CompletionResponse, AiError> {
    let cancel = request.cancel.clone();
    let fallback_model = request.options.model.clone();
    let mut response = send_request(&provider, &base_url, &request, true).await?;

    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false);

    if !is_sse {
        // Some gateways answer a stream request with a plain message body.
        let body = race_cancel(cancel.as_ref(), response.text())
            .await?
            .map_err(|error| transport_error(&provider, error))?;
        return parse_message_body(&body, &fallback_model, Some(&on_event));
    }

    let mut framer = SseFramer::new();
    let mut stream = AnthropicStream::new();

    loop {
        let chunk = race_cancel(cancel.as_ref(), response.chunk())
            .await?
            .map_err(|error| transport_error(&provider, error))?;
        let Some(chunk) = chunk else {
            break;
        };
        let text = String::from_utf8_lossy(&chunk).to_string();
        for data in framer.push(&text) {
            stream.apply_payload(&data, &on_event)?;
        }
    }
    if let Some(data) = framer.flush() {
        stream.apply_payload(&data, &on_event)?;
    }

    Ok(stream.into_response(&fallback_model))
}
