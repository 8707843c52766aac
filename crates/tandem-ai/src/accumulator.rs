use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::types::{BlockDelta, BlockOpen, ContentBlock, ProviderEvent, StreamEvent};

/// One step of the per-stream state machine: the canonical events to emit
/// and, on `block_stop`, the finalized text block for the caller to collect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput {
    pub events: Vec<StreamEvent>,
    pub finalized: Option<ContentBlock>,
}

impl StepOutput {
    fn events(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            finalized: None,
        }
    }
}

/// Folds raw vendor events into canonical [`StreamEvent`]s.
///
/// State carried between calls is exactly `(block_index, accumulated_text)`.
/// Indices are assigned monotonically per new block and never reused within
/// one response. Tool-call argument fragments are not accumulated here; they
/// belong to [`ToolCallAssembler`], keyed by the vendor's call index.
#[derive(Debug, Clone, Default)]
pub struct BlockAccumulator {
    block_index: usize,
    accumulated_text: String,
    next_index: usize,
    started: bool,
}

impl BlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn step(&mut self, event: ProviderEvent) -> StepOutput {
        match event {
            ProviderEvent::MessageStart => StepOutput::events(vec![StreamEvent::MessageStart]),
            ProviderEvent::BlockStart(open) => {
                let index = self.next_index;
                self.next_index += 1;
                self.block_index = index;
                self.accumulated_text.clear();
                self.started = true;

                let block = match open {
                    BlockOpen::Text => ContentBlock::Text {
                        text: String::new(),
                    },
                    BlockOpen::ToolUse { id, name } => ContentBlock::ToolUse {
                        id,
                        name,
                        input: Value::Object(Map::new()),
                    },
                };
                StepOutput::events(vec![StreamEvent::ContentBlockStart { index, block }])
            }
            ProviderEvent::TextDelta(text) => {
                if !self.started {
                    return StepOutput::default();
                }
                self.accumulated_text.push_str(&text);
                StepOutput::events(vec![StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: BlockDelta::TextDelta { text },
                }])
            }
            ProviderEvent::JsonDelta(partial_json) => {
                if !self.started {
                    return StepOutput::default();
                }
                // json fragments are assembled by the caller, keyed by
                // tool-call index; accumulated_text stays untouched.
                StepOutput::events(vec![StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: BlockDelta::InputJsonDelta { partial_json },
                }])
            }
            ProviderEvent::BlockStop => {
                if !self.started {
                    return StepOutput::default();
                }
                let finalized = if self.accumulated_text.is_empty() {
                    None
                } else {
                    Some(ContentBlock::Text {
                        text: std::mem::take(&mut self.accumulated_text),
                    })
                };
                StepOutput {
                    events: vec![StreamEvent::ContentBlockStop {
                        index: self.block_index,
                    }],
                    finalized,
                }
            }
            ProviderEvent::MessageDelta { output_tokens } => {
                StepOutput::events(vec![StreamEvent::MessageDelta { output_tokens }])
            }
            ProviderEvent::MessageStop => StepOutput::events(vec![StreamEvent::MessageStop]),
            ProviderEvent::Other => StepOutput::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles streamed tool-call fragments, keyed by the vendor's call index.
///
/// First sighting of an index creates `{id, name, arguments: ""}`; later
/// deltas append to `arguments`, and late `id`/`name` values overwrite.
/// `finish` parses each arguments string; malformed or empty JSON defaults
/// the input to `{}` so a stream never fails on a partial fragment.
#[derive(Debug, Clone, Default)]
pub struct ToolCallAssembler {
    calls: HashMap<usize, PendingToolCall>,
    seen_order: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.seen_order.is_empty()
    }

    pub fn call_count(&self) -> usize {
        self.seen_order.len()
    }

    /// True when `index` had not been seen before this update.
    pub fn update(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments_delta: &str,
    ) -> bool {
        let first_sighting = !self.calls.contains_key(&index);
        if first_sighting {
            self.seen_order.push(index);
        }

        let call = self.calls.entry(index).or_default();
        if let Some(id) = id {
            call.id = id.to_string();
        }
        if let Some(name) = name {
            call.name = name.to_string();
        }
        call.arguments.push_str(arguments_delta);
        first_sighting
    }

    pub fn finish(self) -> Vec<AssembledToolCall> {
        self.finish_indexed()
            .into_iter()
            .map(|(_, call)| call)
            .collect()
    }

    /// Like [`finish`](Self::finish) but keeps the vendor call index,
    /// still in first-seen order.
    pub fn finish_indexed(self) -> Vec<(usize, AssembledToolCall)> {
        let mut calls = self.calls;
        self.seen_order
            .into_iter()
            .filter_map(|index| calls.remove(&index).map(|call| (index, call)))
            .map(|(index, call)| {
                (
                    index,
                    AssembledToolCall {
                        id: call.id,
                        name: call.name,
                        input: parse_arguments(&call.arguments),
                    },
                )
            })
            .collect()
    }
}

fn parse_arguments(buffer: &str) -> Value {
    if buffer.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str::<Value>(buffer).unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Terminal event sequence for wires without explicit block stops: one
/// `content_block_stop` for the text block when text exists, one per tool
/// call in first-seen order, one `message_delta` with the final output
/// token count, then exactly one `message_stop`.
pub fn finalize_stream(
    text_index: Option<usize>,
    tool_indices: &[usize],
    output_tokens: Option<u64>,
) -> Vec<StreamEvent> {
    let mut events = Vec::with_capacity(tool_indices.len() + 3);
    if let Some(index) = text_index {
        events.push(StreamEvent::ContentBlockStop { index });
    }
    for index in tool_indices {
        events.push(StreamEvent::ContentBlockStop { index: *index });
    }
    events.push(StreamEvent::MessageDelta { output_tokens });
    events.push(StreamEvent::MessageStop);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(accumulator: &mut BlockAccumulator, events: Vec<ProviderEvent>) -> Vec<StreamEvent> {
        events
            .into_iter()
            .flat_map(|event| accumulator.step(event).events)
            .collect()
    }

    #[test]
    fn text_stream_emits_spec_event_sequence_and_one_finalized_block() {
        let mut accumulator = BlockAccumulator::new();
        let mut emitted = Vec::new();
        let mut finalized = Vec::new();

        for event in [
            ProviderEvent::MessageStart,
            ProviderEvent::BlockStart(BlockOpen::Text),
            ProviderEvent::TextDelta("Hello".to_string()),
            ProviderEvent::TextDelta(", world!".to_string()),
            ProviderEvent::BlockStop,
            ProviderEvent::MessageDelta {
                output_tokens: Some(5),
            },
            ProviderEvent::MessageStop,
        ] {
            let output = accumulator.step(event);
            emitted.extend(output.events);
            finalized.extend(output.finalized);
        }

        assert_eq!(
            finalized,
            vec![ContentBlock::Text {
                text: "Hello, world!".to_string(),
            }]
        );
        assert_eq!(
            emitted,
            vec![
                StreamEvent::MessageStart,
                StreamEvent::ContentBlockStart {
                    index: 0,
                    block: ContentBlock::Text {
                        text: String::new(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::TextDelta {
                        text: "Hello".to_string(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::TextDelta {
                        text: ", world!".to_string(),
                    },
                },
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::MessageDelta {
                    output_tokens: Some(5),
                },
                StreamEvent::MessageStop,
            ]
        );
    }

    #[test]
    fn block_indices_increase_and_every_start_has_one_stop() {
        let mut accumulator = BlockAccumulator::new();
        let emitted = collect(
            &mut accumulator,
            vec![
                ProviderEvent::MessageStart,
                ProviderEvent::BlockStart(BlockOpen::Text),
                ProviderEvent::TextDelta("a".to_string()),
                ProviderEvent::BlockStop,
                ProviderEvent::BlockStart(BlockOpen::ToolUse {
                    id: "call_1".to_string(),
                    name: "search".to_string(),
                }),
                ProviderEvent::JsonDelta("{\"q\":".to_string()),
                ProviderEvent::JsonDelta("\"ai\"}".to_string()),
                ProviderEvent::BlockStop,
                ProviderEvent::BlockStart(BlockOpen::Text),
                ProviderEvent::BlockStop,
                ProviderEvent::MessageStop,
            ],
        );

        let mut starts = Vec::new();
        let mut stops = Vec::new();
        for event in &emitted {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => starts.push(*index),
                StreamEvent::ContentBlockStop { index } => stops.push(*index),
                _ => {}
            }
        }
        assert_eq!(starts, vec![0, 1, 2]);
        assert_eq!(stops, vec![0, 1, 2]);
        assert!(starts.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn json_deltas_do_not_touch_accumulated_text() {
        let mut accumulator = BlockAccumulator::new();
        accumulator.step(ProviderEvent::BlockStart(BlockOpen::ToolUse {
            id: "call_1".to_string(),
            name: "search".to_string(),
        }));
        accumulator.step(ProviderEvent::JsonDelta("{\"q\":\"ai\"}".to_string()));
        assert_eq!(accumulator.accumulated_text(), "");

        let output = accumulator.step(ProviderEvent::BlockStop);
        assert_eq!(output.finalized, None);
    }

    #[test]
    fn empty_text_block_finalizes_nothing() {
        let mut accumulator = BlockAccumulator::new();
        accumulator.step(ProviderEvent::BlockStart(BlockOpen::Text));
        let output = accumulator.step(ProviderEvent::BlockStop);
        assert_eq!(
            output.events,
            vec![StreamEvent::ContentBlockStop { index: 0 }]
        );
        assert_eq!(output.finalized, None);
    }

    #[test]
    fn unrecognized_events_emit_nothing_and_leave_state_unchanged() {
        let mut accumulator = BlockAccumulator::new();
        accumulator.step(ProviderEvent::BlockStart(BlockOpen::Text));
        accumulator.step(ProviderEvent::TextDelta("keep".to_string()));

        let output = accumulator.step(ProviderEvent::Other);
        assert_eq!(output, StepOutput::default());
        assert_eq!(accumulator.block_index(), 0);
        assert_eq!(accumulator.accumulated_text(), "keep");
    }

    #[test]
    fn missing_usage_passes_through_as_none() {
        let mut accumulator = BlockAccumulator::new();
        let output = accumulator.step(ProviderEvent::MessageDelta {
            output_tokens: None,
        });
        assert_eq!(
            output.events,
            vec![StreamEvent::MessageDelta {
                output_tokens: None,
            }]
        );
    }

    #[test]
    fn assembler_concatenation_is_associative_across_partitions() {
        let whole = "{\"q\":\"ai\"}";
        let partitions: Vec<Vec<&str>> = vec![
            vec![whole],
            vec!["{\"q\":", "\"ai\"}"],
            vec!["{", "\"q\"", ":\"a", "i\"}"],
        ];

        let mut parsed = Vec::new();
        for fragments in partitions {
            let mut assembler = ToolCallAssembler::new();
            for (position, fragment) in fragments.iter().enumerate() {
                let id = (position == 0).then_some("call_1");
                let name = (position == 0).then_some("search");
                assembler.update(0, id, name, fragment);
            }
            let calls = assembler.finish();
            assert_eq!(calls.len(), 1);
            parsed.push(calls[0].input.clone());
        }

        assert!(parsed.iter().all(|input| *input == json!({"q": "ai"})));
    }

    #[test]
    fn malformed_or_empty_arguments_default_to_empty_object() {
        let mut assembler = ToolCallAssembler::new();
        assembler.update(0, Some("call_1"), Some("broken"), "{\"q\": not-json");
        assembler.update(1, Some("call_2"), Some("empty"), "");
        let calls = assembler.finish();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].input, json!({}));
        assert_eq!(calls[1].input, json!({}));
    }

    #[test]
    fn assembler_applies_late_id_and_name_and_keeps_first_seen_order() {
        let mut assembler = ToolCallAssembler::new();
        assembler.update(1, None, None, "{\"b\":");
        assembler.update(0, Some("call_a"), Some("alpha"), "{}");
        assembler.update(1, Some("call_b"), Some("beta"), "1}");

        let calls = assembler.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_b");
        assert_eq!(calls[0].name, "beta");
        assert_eq!(calls[0].input, json!({"b": 1}));
        assert_eq!(calls[1].id, "call_a");
        assert_eq!(calls[1].name, "alpha");
    }

    #[test]
    fn finalize_orders_text_stop_then_tool_stops_then_delta_then_stop() {
        let events = finalize_stream(Some(0), &[1, 2], Some(42));
        assert_eq!(
            events,
            vec![
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::ContentBlockStop { index: 1 },
                StreamEvent::ContentBlockStop { index: 2 },
                StreamEvent::MessageDelta {
                    output_tokens: Some(42),
                },
                StreamEvent::MessageStop,
            ]
        );

        let tool_only = finalize_stream(None, &[0], None);
        assert_eq!(
            tool_only,
            vec![
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::MessageDelta {
                    output_tokens: None,
                },
                StreamEvent::MessageStop,
            ]
        );
    }
}
