use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::accumulator::{finalize_stream, ToolCallAssembler};
use crate::adapter::{
    AdapterFuture, AdapterRef, CompletionAdapter, CompletionRequest, OnStreamEvent,
};
use crate::error::{AiError, AiErrorCode};
use crate::providers::common::{
    http_error, join_url, race_cancel, shared_http_client, synthesize_response_id,
    transport_error, SseFramer,
};
use crate::types::{
    BlockDelta, CompletionOptions, CompletionResponse, ContentBlock, Message, MessageContent,
    Role, StopReason, StreamEvent, ToolSpec, Usage,
};

/// Chat-completions wire. Also the base for the OpenAI-compatible
/// derivations (see `openai_compat`), which differ only in endpoint,
/// default models and whether a key is required.
pub(crate) struct OpenAiAdapter {
    provider: String,
    base_url: String,
    key_required: bool,
}

impl OpenAiAdapter {
    pub(crate) fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        key_required: bool,
    ) -> Self {
        Self {
            provider: provider.into(),
            base_url: base_url.into(),
            key_required,
        }
    }
}

impl CompletionAdapter for OpenAiAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn complete(&self, request: CompletionRequest) -> AdapterFuture {
        let provider = self.provider.clone();
        let base_url = self.base_url.clone();
        let key_required = self.key_required;
        Box::pin(async move { run_complete(provider, base_url, key_required, request).await })
    }

    fn complete_stream(
        &self,
        request: CompletionRequest,
        on_event: OnStreamEvent,
    ) -> AdapterFuture {
        let provider = self.provider.clone();
        let base_url = self.base_url.clone();
        let key_required = self.key_required;
        Box::pin(
            async move { run_stream(provider, base_url, key_required, request, on_event).await },
        )
    }
}

pub(crate) fn adapter() -> AdapterRef {
    Arc::new(OpenAiAdapter::new(
        "openai",
        "https://api.openai.com/v1",
        true,
    ))
}

async fn send_request(
    provider: &str,
    base_url: &str,
    key_required: bool,
    request: &CompletionRequest,
    stream: bool,
) -> Result<reqwest::Response, AiError> {
    let api_key = match request.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => Some(key.to_string()),
        _ if key_required => {
            return Err(AiError::new(
                AiErrorCode::AuthMissing,
                format!("Missing API key for provider '{provider}'"),
            ));
        }
        _ => None,
    };

    let payload = build_openai_payload(&request.messages, &request.options, stream);
    let endpoint = join_url(base_url, "chat/completions");
    let client = shared_http_client(base_url);

    debug!(
        provider,
        model = request.options.model.as_str(),
        stream,
        "sending openai completion request"
    );

    let mut builder = client
        .post(endpoint.as_str())
        .header("Content-Type", "application/json");
    if let Some(api_key) = api_key {
        builder = builder.header("Authorization", format!("Bearer {api_key}"));
    }
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
    key_required: bool,
    request: CompletionRequest,
) -> Result<CompletionResponse, AiError> {
    let cancel = request.cancel.clone();
    let fallback_model = request.options.model.clone();
    let response = send_request(&provider, &base_url, key_required, &request, false).await?;
    let body = race_cancel(cancel.as_ref(), response.text())
        .await?
        .map_err(|error| transport_error(&provider, error))?;
    parse_completion_body(&body, &fallback_model)
}

async fn run_stream(
    provider: String,
    base_url: String,
    key_required: bool,
    request: CompletionRequest,
    on_event: OnStreamEvent,
) -> Result<CompletionResponse, AiError> {
    let cancel = request.cancel.clone();
    let fallback_model = request.options.model.clone();
    let mut response = send_request(&provider, &base_url, key_required, &request, true).await?;

    let mut framer = SseFramer::new();
    let mut state = OpenAiStream::new();
    let mut done = false;

    'read: loop {
        let chunk = race_cancel(cancel.as_ref(), response.chunk())
            .await?
            .map_err(|error| transport_error(&provider, error))?;
        let Some(chunk) = chunk else {
            break;
        };
        let text = String::from_utf8_lossy(&chunk).to_string();
        for data in framer.push(&text) {
            if data == "[DONE]" {
                done = true;
                break 'read;
            }
            state.apply_chunk(&data, &on_event)?;
        }
    }
    if !done {
        if let Some(data) = framer.flush() {
            if data != "[DONE]" {
                state.apply_chunk(&data, &on_event)?;
            }
        }
    }

    Ok(state.finish(&fallback_model, &on_event))
}

struct OpenAiStream {
    assembler: ToolCallAssembler,
    text: String,
    text_index: Option<usize>,
    tool_indices: Vec<(usize, usize)>,
    next_index: usize,
    started: bool,
    response_id: Option<String>,
    model: Option<String>,
    input_tokens: u64,
    output_tokens: Option<u64>,
    stop_reason: StopReason,
}

impl OpenAiStream {
    fn new() -> Self {
        Self {
            assembler: ToolCallAssembler::new(),
            text: String::new(),
            text_index: None,
            tool_indices: Vec::new(),
            next_index: 0,
            started: false,
            response_id: None,
            model: None,
            input_tokens: 0,
            output_tokens: None,
            stop_reason: StopReason::EndTurn,
        }
    }

    fn apply_chunk(&mut self, data: &str, on_event: &OnStreamEvent) -> Result<(), AiError> {
        let chunk: Value = serde_json::from_str(data).map_err(|error| {
            AiError::new(
                AiErrorCode::ProviderProtocol,
                format!("Invalid OpenAI chunk JSON: {error}"),
            )
        })?;

        if !self.started {
            self.started = true;
            on_event(StreamEvent::MessageStart);
        }
        if self.response_id.is_none() {
            if let Some(id) = chunk.get("id").and_then(Value::as_str) {
                self.response_id = Some(id.to_string());
            }
        }
        if self.model.is_none() {
            if let Some(model) = chunk.get("model").and_then(Value::as_str) {
                self.model = Some(model.to_string());
            }
        }
        if let Some(usage) = chunk.get("usage") {
            if let Some(input) = usage.get("prompt_tokens").and_then(Value::as_u64) {
                self.input_tokens = input;
            }
            if let Some(output) = usage.get("completion_tokens").and_then(Value::as_u64) {
                self.output_tokens = Some(output);
            }
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return Ok(());
        };

        if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.stop_reason = map_openai_stop_reason(Some(finish_reason));
        }

        let delta = choice.get("delta");
        if let Some(content) = delta
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            if !content.is_empty() {
                let index = match self.text_index {
                    Some(index) => index,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.text_index = Some(index);
                        on_event(StreamEvent::ContentBlockStart {
                            index,
                            block: ContentBlock::Text {
                                text: String::new(),
                            },
                        });
                        index
                    }
                };
                self.text.push_str(content);
                on_event(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta {
                        text: content.to_string(),
                    },
                });
            }
        }

        for tool_call in delta
            .and_then(|delta| delta.get("tool_calls"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let vendor_index = tool_call
                .get("index")
                .and_then(Value::as_u64)
                .map(|value| value as usize)
                .unwrap_or(0);
            let id = tool_call.get("id").and_then(Value::as_str);
            let name = tool_call
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str);
            let arguments = tool_call
                .get("function")
                .and_then(|function| function.get("arguments"))
                .and_then(Value::as_str)
                .unwrap_or("");

            let first_sighting = self.assembler.update(vendor_index, id, name, arguments);
            if first_sighting {
                let index = self.next_index;
                self.next_index += 1;
                self.tool_indices.push((vendor_index, index));
                on_event(StreamEvent::ContentBlockStart {
                    index,
                    block: ContentBlock::ToolUse {
                        id: id.unwrap_or_default().to_string(),
                        name: name.unwrap_or_default().to_string(),
                        input: Value::Object(Map::new()),
                    },
                });
            }
            if !arguments.is_empty() {
                let index = self
                    .tool_indices
                    .iter()
                    .find(|(vendor, _)| *vendor == vendor_index)
                    .map(|(_, canonical)| *canonical)
                    .unwrap_or(0);
                on_event(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: arguments.to_string(),
                    },
                });
            }
        }

        Ok(())
    }

    /// This wire has no explicit block stops; the ordered terminal sequence
    /// comes from the accumulator's finalize helper.
    fn finish(self, fallback_model: &str, on_event: &OnStreamEvent) -> CompletionResponse {
        let canonical_tool_indices: Vec<usize> = self
            .tool_indices
            .iter()
            .map(|(_, canonical)| *canonical)
            .collect();
        let has_text = !self.text.is_empty();
        for event in finalize_stream(
            self.text_index.filter(|_| has_text),
            &canonical_tool_indices,
            self.output_tokens,
        ) {
            on_event(event);
        }

        let mut entries: Vec<(usize, ContentBlock)> = Vec::new();
        if let Some(index) = self.text_index {
            if has_text {
                entries.push((index, ContentBlock::Text { text: self.text }));
            }
        }
        let assembled: std::collections::HashMap<_, _> =
            self.assembler.finish_indexed().into_iter().collect();
        for (vendor_index, canonical_index) in &self.tool_indices {
            if let Some(call) = assembled.get(vendor_index) {
                entries.push((
                    *canonical_index,
                    ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    },
                ));
            }
        }
        entries.sort_by_key(|(index, _)| *index);

        CompletionResponse {
            id: self.response_id.unwrap_or_else(synthesize_response_id),
            content: entries.into_iter().map(|(_, block)| block).collect(),
            model: self
                .model
                .unwrap_or_else(|| fallback_model.to_string()),
            stop_reason: self.stop_reason,
            usage: Usage::new(self.input_tokens, self.output_tokens.unwrap_or(0)),
        }
    }
}

pub(crate) fn map_openai_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn parse_completion_body(body: &str, fallback_model: &str) -> Result<CompletionResponse, AiError> {
    let payload: Value = serde_json::from_str(body).map_err(|error| {
        AiError::new(
            AiErrorCode::ProviderProtocol,
            format!("Invalid OpenAI response body: {error}"),
        )
    })?;

    let choice = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| {
            AiError::new(
                AiErrorCode::ProviderProtocol,
                "OpenAI response missing choices[0]",
            )
        })?;
    let message = choice.get("message").cloned().unwrap_or_default();

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }
    for tool_call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let arguments = tool_call
            .get("function")
            .and_then(|function| function.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let input = if arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(arguments).unwrap_or_else(|_| Value::Object(Map::new()))
        };
        content.push(ContentBlock::ToolUse {
            id: tool_call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: tool_call
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input,
        });
    }

    let usage = payload.get("usage");
    let input_tokens = usage
        .and_then(|usage| usage.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|usage| usage.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(CompletionResponse {
        id: payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(synthesize_response_id),
        content,
        model: payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(fallback_model)
            .to_string(),
        stop_reason: map_openai_stop_reason(
            choice.get("finish_reason").and_then(Value::as_str),
        ),
        usage: Usage::new(input_tokens, output_tokens),
    })
}

fn build_openai_payload(messages: &[Message], options: &CompletionOptions, stream: bool) -> Value {
    let mut turns = Vec::new();
    if let Some(prompt) = &options.system_prompt {
        turns.push(json!({ "role": "system", "content": prompt }));
    }
    for message in messages {
        convert_message(message, &mut turns);
    }

    let mut payload = json!({
        "model": options.model,
        "messages": turns,
        "stream": stream,
    });
    if stream {
        payload["stream_options"] = json!({ "include_usage": true });
    }
    if options.max_tokens > 0 {
        payload["max_tokens"] = json!(options.max_tokens);
    }
    if let Some(temperature) = options.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = options.top_p {
        payload["top_p"] = json!(top_p);
    }
    if let Some(stop_sequences) = &options.stop_sequences {
        payload["stop"] = json!(stop_sequences);
    }
    if let Some(tools) = &options.tools {
        payload["tools"] = convert_tools(tools);
    }
    payload
}

fn convert_message(message: &Message, turns: &mut Vec<Value>) {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    match &message.content {
        MessageContent::Text(text) => {
            turns.push(json!({ "role": role, "content": text }));
        }
        MessageContent::Blocks(blocks) => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_turns = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            },
                        }));
                    }
                    // Tool results are a distinct `tool` role turn on this
                    // wire, never inline content.
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        tool_turns.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                    ContentBlock::Image { source } => {
                        tool_turns.push(json!({
                            "role": role,
                            "content": [{
                                "type": "image_url",
                                "image_url": {
                                    "url": format!(
                                        "data:{};base64,{}",
                                        source.media_type, source.data
                                    ),
                                },
                            }],
                        }));
                    }
                    // Unsupported media degrades to an empty text block.
                    ContentBlock::Document { .. } | ContentBlock::Audio { .. } => {
                        text_parts.push(String::new());
                    }
                }
            }

            if !text_parts.is_empty() || !tool_calls.is_empty() {
                let mut turn = json!({ "role": role });
                turn["content"] = Value::String(text_parts.join(""));
                if !tool_calls.is_empty() {
                    turn["tool_calls"] = Value::Array(tool_calls);
                }
                turns.push(turn);
            }
            turns.extend(tool_turns);
        }
    }
}

fn convert_tools(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect(),
    )
}
