use serde_json::{json, Value};

use crate::types::{
    CompletionOptions, ContentBlock, Message, MessageContent, Role, ToolSpec,
};

pub(super) fn build_anthropic_payload(
    messages: &[Message],
    options: &CompletionOptions,
    stream: bool,
) -> Value {
    let (system, turns) = convert_messages(messages, options);

    let mut payload = json!({
        "model": options.model,
        "stream": stream,
        "messages": turns,
        "max_tokens": effective_max_tokens(options),
    });

    if let Some(system) = system {
        payload["system"] = Value::String(system);
    }
    if let Some(tools) = &options.tools {
        payload["tools"] = convert_tools(tools);
    }
    if let Some(temperature) = options.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = options.top_p {
        payload["top_p"] = json!(top_p);
    }
    if let Some(stop_sequences) = &options.stop_sequences {
        payload["stop_sequences"] = json!(stop_sequences);
    }

    payload
}

fn effective_max_tokens(options: &CompletionOptions) -> u32 {
    if options.max_tokens == 0 {
        1024
    } else {
        options.max_tokens
    }
}

/// System turns fold into the vendor's dedicated system field; everything
/// else becomes an ordered user/assistant turn.
fn convert_messages(messages: &[Message], options: &CompletionOptions) -> (Option<String>, Value) {
    let mut system_parts = Vec::new();
    if let Some(prompt) = &options.system_prompt {
        system_parts.push(prompt.clone());
    }

    let mut turns = Vec::new();
    for message in messages {
        match message.role {
            Role::System => {
                if let MessageContent::Text(text) = &message.content {
                    system_parts.push(text.clone());
                }
            }
            Role::User => turns.push(json!({
                "role": "user",
                "content": convert_content(&message.content),
            })),
            Role::Assistant => turns.push(json!({
                "role": "assistant",
                "content": convert_content(&message.content),
            })),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, Value::Array(turns))
}

fn convert_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => {
            Value::Array(blocks.iter().map(convert_block).collect())
        }
    }
}

fn convert_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        }),
        ContentBlock::Image { source } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": source.media_type,
                "data": source.data,
            },
        }),
        ContentBlock::Document { source } => json!({
            "type": "document",
            "source": {
                "type": "base64",
                "media_type": source.media_type,
                "data": source.data,
            },
        }),
        // No audio support on this wire; degrade instead of erroring.
        ContentBlock::Audio { .. } => json!({
            "type": "text",
            "text": "",
        }),
    }
}

fn convert_tools(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect(),
    )
}
