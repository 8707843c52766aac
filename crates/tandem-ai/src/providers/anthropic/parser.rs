use serde_json::Value;

use crate::accumulator::{BlockAccumulator, ToolCallAssembler};
use crate::adapter::OnStreamEvent;
use crate::error::{AiError, AiErrorCode};
use crate::providers::common::synthesize_response_id;
use crate::types::{BlockOpen, ContentBlock, ProviderEvent, StopReason, StreamEvent, Usage};

#[derive(Debug, Clone)]
enum SlotEntry {
    Text(String),
    Tool(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Tool(usize),
}

/// Per-stream parse state for the Anthropic messages wire. Vendor events are
/// normalized into [`ProviderEvent`]s, folded through the accumulator, and
/// collected into the final ordered content sequence.
pub(super) struct AnthropicStream {
    accumulator: BlockAccumulator,
    assembler: ToolCallAssembler,
    entries: Vec<SlotEntry>,
    open_block: Option<OpenKind>,
    response_id: Option<String>,
    model: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: StopReason,
}

impl AnthropicStream {
    pub(super) fn new() -> Self {
        Self {
            accumulator: BlockAccumulator::new(),
            assembler: ToolCallAssembler::new(),
            entries: Vec::new(),
            open_block: None,
            response_id: None,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: StopReason::EndTurn,
        }
    }

    pub(super) fn apply_payload(
        &mut self,
        data: &str,
        on_event: &OnStreamEvent,
    ) -> Result<(), AiError> {
        let event: Value = serde_json::from_str(data).map_err(|error| {
            AiError::new(
                AiErrorCode::ProviderProtocol,
                format!("Invalid Anthropic SSE event: {error}"),
            )
        })?;

        for provider_event in self.normalize(&event) {
            self.feed(provider_event, on_event);
        }
        Ok(())
    }

    fn feed(&mut self, event: ProviderEvent, on_event: &OnStreamEvent) {
        let closing = if matches!(event, ProviderEvent::BlockStop) {
            self.open_block.take()
        } else {
            None
        };
        let output = self.accumulator.step(event);
        if let Some(ContentBlock::Text { text }) = output.finalized {
            self.entries.push(SlotEntry::Text(text));
        } else if let Some(OpenKind::Tool(vendor_index)) = closing {
            self.entries.push(SlotEntry::Tool(vendor_index));
        }
        for stream_event in output.events {
            on_event(stream_event);
        }
    }

    /// Maps one vendor event into the raw vocabulary the accumulator folds.
    /// Unrecognized event types normalize to nothing.
    fn normalize(&mut self, event: &Value) -> Vec<ProviderEvent> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                if let Some(message) = event.get("message") {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        self.response_id = Some(id.to_string());
                    }
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        self.apply_usage(usage);
                    }
                }
                vec![ProviderEvent::MessageStart]
            }
            "content_block_start" => {
                let vendor_index = event
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|value| value as usize)
                    .unwrap_or(0);
                let block_type = event
                    .get("content_block")
                    .and_then(|block| block.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match block_type {
                    "text" => {
                        self.open_block = Some(OpenKind::Text);
                        vec![ProviderEvent::BlockStart(BlockOpen::Text)]
                    }
                    "tool_use" => {
                        let id = event
                            .get("content_block")
                            .and_then(|block| block.get("id"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let name = event
                            .get("content_block")
                            .and_then(|block| block.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        self.assembler
                            .update(vendor_index, Some(&id), Some(&name), "");
                        self.open_block = Some(OpenKind::Tool(vendor_index));
                        vec![ProviderEvent::BlockStart(BlockOpen::ToolUse { id, name })]
                    }
                    _ => {
                        self.open_block = None;
                        vec![ProviderEvent::Other]
                    }
                }
            }
            "content_block_delta" => {
                let delta_type = event
                    .get("delta")
                    .and_then(|delta| delta.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match (self.open_block, delta_type) {
                    (Some(OpenKind::Text), "text_delta") => {
                        let text = event
                            .get("delta")
                            .and_then(|delta| delta.get("text"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        vec![ProviderEvent::TextDelta(text)]
                    }
                    (Some(OpenKind::Tool(vendor_index)), "input_json_delta") => {
                        let partial = event
                            .get("delta")
                            .and_then(|delta| delta.get("partial_json"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        self.assembler.update(vendor_index, None, None, &partial);
                        vec![ProviderEvent::JsonDelta(partial)]
                    }
                    _ => vec![ProviderEvent::Other],
                }
            }
            "content_block_stop" => {
                if self.open_block.is_some() {
                    vec![ProviderEvent::BlockStop]
                } else {
                    vec![ProviderEvent::Other]
                }
            }
            "message_delta" => {
                if let Some(reason) = event
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = map_anthropic_stop_reason(Some(reason));
                }
                let output_tokens = event
                    .get("usage")
                    .and_then(|usage| usage.get("output_tokens"))
                    .and_then(Value::as_u64);
                if let Some(tokens) = output_tokens {
                    self.output_tokens = tokens;
                }
                vec![ProviderEvent::MessageDelta { output_tokens }]
            }
            "message_stop" => vec![ProviderEvent::MessageStop],
            _ => vec![ProviderEvent::Other],
        }
    }

    fn apply_usage(&mut self, usage: &Value) {
        if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = input;
        }
        if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = output;
        }
    }

    pub(super) fn into_response(self, fallback_model: &str) -> crate::types::CompletionResponse {
        let assembled: std::collections::HashMap<_, _> =
            self.assembler.finish_indexed().into_iter().collect();

        let mut content = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            match entry {
                SlotEntry::Text(text) => content.push(ContentBlock::Text { text }),
                SlotEntry::Tool(vendor_index) => {
                    if let Some(call) = assembled.get(&vendor_index) {
                        content.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                        });
                    }
                }
            }
        }

        crate::types::CompletionResponse {
            id: self.response_id.unwrap_or_else(synthesize_response_id),
            content,
            model: self
                .model
                .unwrap_or_else(|| fallback_model.to_string()),
            stop_reason: self.stop_reason,
            usage: Usage::new(self.input_tokens, self.output_tokens),
        }
    }
}

/// Total mapping: every vendor value lands on one of the four canonical
/// reasons, `end_turn` when absent or unrecognized.
pub(super) fn map_anthropic_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") => StopReason::EndTurn,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("tool_use") => StopReason::ToolUse,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// Non-stream response body (a plain `message` payload). Emits the synthetic
/// canonical event sequence so streaming consumers observe the same shape.
pub(super) fn parse_message_body(
    body: &str,
    fallback_model: &str,
    on_event: Option<&OnStreamEvent>,
) -> Result<crate::types::CompletionResponse, AiError> {
    let payload: Value = serde_json::from_str(body).map_err(|error| {
        AiError::new(
            AiErrorCode::ProviderProtocol,
            format!("Invalid Anthropic response body: {error}"),
        )
    })?;

    if payload.get("type").and_then(Value::as_str) != Some("message") {
        return Err(AiError::new(
            AiErrorCode::ProviderProtocol,
            "Anthropic response was neither SSE events nor a message payload",
        ));
    }

    let mut content = Vec::new();
    for block in payload
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => content.push(ContentBlock::Text {
                text: block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "tool_use" => content.push(ContentBlock::ToolUse {
                id: block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            }),
            _ => {}
        }
    }

    let usage = payload.get("usage");
    let input_tokens = usage
        .and_then(|usage| usage.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|usage| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let response = crate::types::CompletionResponse {
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
        stop_reason: map_anthropic_stop_reason(
            payload.get("stop_reason").and_then(Value::as_str),
        ),
        usage: Usage::new(input_tokens, output_tokens),
    };

    if let Some(on_event) = on_event {
        emit_synthetic_events(&response, on_event);
    }
    Ok(response)
}

fn emit_synthetic_events(response: &crate::types::CompletionResponse, on_event: &OnStreamEvent) {
    on_event(StreamEvent::MessageStart);
    for (index, block) in response.content.iter().enumerate() {
        let opened = match block {
            ContentBlock::Text { .. } => ContentBlock::Text {
                text: String::new(),
            },
            other => other.clone(),
        };
        on_event(StreamEvent::ContentBlockStart {
            index,
            block: opened,
        });
        if let ContentBlock::Text { text } = block {
            if !text.is_empty() {
                on_event(StreamEvent::ContentBlockDelta {
                    index,
                    delta: crate::types::BlockDelta::TextDelta { text: text.clone() },
                });
            }
        }
        on_event(StreamEvent::ContentBlockStop { index });
    }
    on_event(StreamEvent::MessageDelta {
        output_tokens: Some(response.usage.output_tokens),
    });
    on_event(StreamEvent::MessageStop);
}
