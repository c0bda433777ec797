//! OpenAI stream → Claude SSE stream state machine
//!
//! Consumes incremental OpenAI chunks and produces the Claude event
//! sequence `message_start → (content block lifecycles)* → message_delta →
//! message_stop`. The assembler keeps an append-only record of every block
//! it opened, so the final `Message` for history is derived from the same
//! state that produced the events; the two can never disagree.
//!
//! # Event Mapping
//!
//! | OpenAI chunk                    | Claude event(s)                      |
//! |---------------------------------|--------------------------------------|
//! | first chunk                     | `message_start`, `ping`              |
//! | `delta.content`                 | `content_block_delta` (text_delta)   |
//! | `delta.tool_calls[].id+name`    | `content_block_start` (tool_use)     |
//! | `delta.tool_calls[].arguments`  | `content_block_delta` (input_json)   |
//! | `finish_reason`                 | `message_delta` + `message_stop`     |
//!
//! Text and tool-use blocks never interleave. A chunk carrying both a text
//! fragment and a new tool call closes the text block first, then opens the
//! tool-use block.
//!
//! Every exit path (finish_reason, bare end-of-stream, upstream error)
//! emits exactly one `message_stop`.

use crate::protocol::claude::{ClaudeResponse, ResponseBlock, StopReason, Usage};
use crate::protocol::openai::OpenAiStreamChunk;
use crate::tokens::estimate_tokens;
use crate::translate::response::{map_finish_reason, parse_arguments};
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// One Claude-shaped SSE event
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart {
        id: String,
        model: String,
        input_tokens: u32,
    },
    Ping,
    ContentBlockStart {
        index: u32,
        block: BlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: Delta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        stop_reason: StopReason,
        output_tokens: u32,
    },
    MessageStop,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone)]
pub enum Delta {
    Text { text: String },
    InputJson { partial_json: String },
}

impl StreamEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::Ping => "ping",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// The JSON payload carried on the `data:` line
    pub fn data(&self) -> serde_json::Value {
        match self {
            StreamEvent::MessageStart {
                id,
                model,
                input_tokens,
            } => serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0}
                }
            }),
            StreamEvent::Ping => serde_json::json!({"type": "ping"}),
            StreamEvent::ContentBlockStart { index, block } => {
                let content_block = match block {
                    BlockStart::Text => serde_json::json!({"type": "text", "text": ""}),
                    BlockStart::ToolUse { id, name } => serde_json::json!({
                        "type": "tool_use", "id": id, "name": name, "input": {}
                    }),
                };
                serde_json::json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": content_block
                })
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let delta_json = match delta {
                    Delta::Text { text } => {
                        serde_json::json!({"type": "text_delta", "text": text})
                    }
                    Delta::InputJson { partial_json } => serde_json::json!({
                        "type": "input_json_delta", "partial_json": partial_json
                    }),
                };
                serde_json::json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": delta_json
                })
            }
            StreamEvent::ContentBlockStop { index } => serde_json::json!({
                "type": "content_block_stop",
                "index": index
            }),
            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason.as_str(), "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
            StreamEvent::MessageStop => serde_json::json!({"type": "message_stop"}),
            StreamEvent::Error { message } => serde_json::json!({
                "type": "error",
                "error": {"type": "api_error", "message": message}
            }),
        }
    }

    /// Wire encoding: `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assembler
// ─────────────────────────────────────────────────────────────────────────────

/// One block being (or already) assembled
#[derive(Debug)]
enum Block {
    Text {
        text: String,
    },
    Tool {
        id: String,
        name: String,
        arguments: String,
    },
}

/// State machine that turns OpenAI chunks into Claude events and, as a
/// byproduct, the assembled final `Message`
pub struct StreamAssembler {
    claimed_model: String,
    estimated_input: u32,

    message_id: String,
    started: bool,
    finished: bool,

    /// Next Claude block index, assigned in emission order
    next_index: u32,
    /// Position in `blocks` of the currently open block, with its index
    open: Option<(usize, u32)>,
    blocks: Vec<Block>,
    /// OpenAI tool-call index → position in `blocks`
    by_openai_index: HashMap<usize, usize>,

    /// Usage reported by the upstream, captured from whichever chunk has it
    reported_input: Option<u32>,
    reported_output: Option<u32>,
    /// Heuristic fallback, accumulated per emitted fragment
    estimated_output: u32,

    stop_reason: Option<StopReason>,
}

impl StreamAssembler {
    pub fn new(claimed_model: &str, estimated_input: u32) -> Self {
        Self {
            claimed_model: claimed_model.to_string(),
            estimated_input,
            message_id: "msg_stream".to_string(),
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            blocks: Vec::new(),
            by_openai_index: HashMap::new(),
            reported_input: None,
            reported_output: None,
            estimated_output: 0,
            stop_reason: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[allow(dead_code)] // Read by state-machine tests
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Final usage: upstream-reported when available, heuristic otherwise
    pub fn usage(&self) -> (u32, u32) {
        (
            self.reported_input.unwrap_or(self.estimated_input),
            self.reported_output.unwrap_or(self.estimated_output),
        )
    }

    /// Feed one upstream chunk, producing zero or more Claude events
    pub fn on_chunk(&mut self, chunk: &OpenAiStreamChunk) -> Vec<StreamEvent> {
        // Usage may ride on any chunk, including the trailing usage-only
        // chunk OpenAI sends after finish_reason
        if let Some(usage) = &chunk.usage {
            if usage.prompt_tokens > 0 {
                self.reported_input = Some(usage.prompt_tokens);
            }
            if usage.completion_tokens > 0 {
                self.reported_output = Some(usage.completion_tokens);
            }
        }

        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        self.ensure_started(&chunk.id, &mut events);

        // Text fragment. A fragment arriving while a tool block is open
        // closes that block; text and tool blocks never interleave.
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                if matches!(self.open_block(), Some(Block::Tool { .. })) {
                    self.close_open(&mut events);
                }
                let (pos, index) = match self.open {
                    Some(open) => open,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.blocks.push(Block::Text {
                            text: String::new(),
                        });
                        let open = (self.blocks.len() - 1, index);
                        self.open = Some(open);
                        events.push(StreamEvent::ContentBlockStart {
                            index,
                            block: BlockStart::Text,
                        });
                        open
                    }
                };
                if let Block::Text { text } = &mut self.blocks[pos] {
                    text.push_str(content);
                }
                self.estimated_output += estimate_tokens(content);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::Text {
                        text: content.clone(),
                    },
                });
            }
        }

        // Tool-call deltas. The first delta for an unseen OpenAI index
        // closes the current block and opens a fresh tool-use block; later
        // deltas stream argument fragments.
        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                let args = tc
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .unwrap_or("");

                match self.by_openai_index.get(&tc.index).copied() {
                    Some(pos) => {
                        // Name can arrive after the opening chunk
                        if let Some(new_name) =
                            tc.function.as_ref().and_then(|f| f.name.as_deref())
                        {
                            if let Block::Tool { name, .. } = &mut self.blocks[pos] {
                                if name.is_empty() {
                                    *name = new_name.to_string();
                                }
                            }
                        }
                        if !args.is_empty() {
                            if let Block::Tool { arguments, .. } = &mut self.blocks[pos] {
                                arguments.push_str(args);
                            }
                            self.estimated_output += estimate_tokens(args);
                            match self.open {
                                Some((open_pos, index)) if open_pos == pos => {
                                    events.push(StreamEvent::ContentBlockDelta {
                                        index,
                                        delta: Delta::InputJson {
                                            partial_json: args.to_string(),
                                        },
                                    });
                                }
                                _ => {
                                    // Fragment for a block that already
                                    // closed; keep it in the assembly only
                                    tracing::debug!(
                                        "Late tool_call fragment for closed block (index {})",
                                        tc.index
                                    );
                                }
                            }
                        }
                    }
                    None => {
                        self.close_open(&mut events);

                        let index = self.next_index;
                        self.next_index += 1;
                        let id = tc
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("toolu_{index}"));
                        let name = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();

                        self.blocks.push(Block::Tool {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                        });
                        let pos = self.blocks.len() - 1;
                        self.by_openai_index.insert(tc.index, pos);
                        self.open = Some((pos, index));

                        events.push(StreamEvent::ContentBlockStart {
                            index,
                            block: BlockStart::ToolUse { id, name },
                        });

                        if !args.is_empty() {
                            if let Block::Tool { arguments, .. } = &mut self.blocks[pos] {
                                arguments.push_str(args);
                            }
                            self.estimated_output += estimate_tokens(args);
                            events.push(StreamEvent::ContentBlockDelta {
                                index,
                                delta: Delta::InputJson {
                                    partial_json: args.to_string(),
                                },
                            });
                        }
                    }
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            self.terminate(map_finish_reason(reason), &mut events);
        }

        events
    }

    /// End of upstream stream without an explicit finish_reason
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started("", &mut events);
        self.terminate(StopReason::EndTurn, &mut events);
        events
    }

    /// Upstream error after the stream began: close blocks, surface an
    /// error event, then the mandatory terminal pair
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started("", &mut events);
        self.close_open(&mut events);
        events.push(StreamEvent::Error {
            message: message.to_string(),
        });
        self.terminate(StopReason::Error, &mut events);
        events
    }

    /// The assembled `Message`, derived from the same block record that
    /// produced the event stream
    pub fn assembled(&self) -> ClaudeResponse {
        let content = self
            .blocks
            .iter()
            .map(|block| match block {
                Block::Text { text } => ResponseBlock::Text { text: text.clone() },
                Block::Tool {
                    id,
                    name,
                    arguments,
                } => ResponseBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: parse_arguments(arguments),
                },
            })
            .collect();

        let (input_tokens, output_tokens) = self.usage();

        ClaudeResponse {
            id: self.message_id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            model: self.claimed_model.clone(),
            content,
            stop_reason: self.stop_reason,
            stop_sequence: None,
            usage: Usage {
                input_tokens,
                output_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
        }
    }

    fn ensure_started(&mut self, chunk_id: &str, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        if !chunk_id.is_empty() {
            self.message_id = format!("msg_{}", chunk_id.trim_start_matches("chatcmpl-"));
        }
        events.push(StreamEvent::MessageStart {
            id: self.message_id.clone(),
            model: self.claimed_model.clone(),
            input_tokens: self.estimated_input,
        });
        events.push(StreamEvent::Ping);
        self.started = true;
    }

    fn open_block(&self) -> Option<&Block> {
        self.open.map(|(pos, _)| &self.blocks[pos])
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((_, index)) = self.open.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn terminate(&mut self, stop_reason: StopReason, events: &mut Vec<StreamEvent>) {
        self.close_open(events);
        self.stop_reason = Some(stop_reason);
        let (_, output_tokens) = self.usage();
        events.push(StreamEvent::MessageDelta {
            stop_reason,
            output_tokens,
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(body: serde_json::Value) -> OpenAiStreamChunk {
        serde_json::from_value(body).unwrap()
    }

    fn text_chunk(text: &str) -> OpenAiStreamChunk {
        chunk(serde_json::json!({
            "id": "chatcmpl-s1",
            "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
        }))
    }

    fn finish_chunk(reason: &str) -> OpenAiStreamChunk {
        chunk(serde_json::json!({
            "id": "chatcmpl-s1",
            "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
        }))
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    #[test]
    fn test_plain_text_event_sequence() {
        let mut asm = StreamAssembler::new("claude-3-5-haiku-20241022", 3);
        let mut events = Vec::new();

        events.extend(asm.on_chunk(&chunk(serde_json::json!({
            "id": "chatcmpl-s1",
            "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
        }))));
        events.extend(asm.on_chunk(&text_chunk("Hello")));
        events.extend(asm.on_chunk(&text_chunk(" world")));
        events.extend(asm.on_chunk(&finish_chunk("stop")));

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let assembled = asm.assembled();
        assert_eq!(assembled.text(), "Hello world");
        assert_eq!(assembled.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(assembled.model, "claude-3-5-haiku-20241022");
    }

    #[test]
    fn test_delta_concatenation_matches_assembled_text() {
        let mut asm = StreamAssembler::new("m", 0);
        let fragments = ["The", " quick", " brown", " fox"];
        let mut streamed = String::new();

        for frag in fragments {
            for event in asm.on_chunk(&text_chunk(frag)) {
                if let StreamEvent::ContentBlockDelta {
                    delta: Delta::Text { text },
                    ..
                } = event
                {
                    streamed.push_str(&text);
                }
            }
        }
        asm.on_chunk(&finish_chunk("stop"));

        assert_eq!(streamed, asm.assembled().text());
    }

    #[test]
    fn test_tool_call_reconstruction() {
        let mut asm = StreamAssembler::new("m", 0);
        let mut events = Vec::new();

        events.extend(asm.on_chunk(&chunk(serde_json::json!({
            "id": "chatcmpl-t",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_w", "function": {"name": "get_weather", "arguments": ""}}
            ]}, "finish_reason": null}]
        }))));
        events.extend(asm.on_chunk(&chunk(serde_json::json!({
            "id": "chatcmpl-t",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"city\":"}}
            ]}, "finish_reason": null}]
        }))));
        events.extend(asm.on_chunk(&chunk(serde_json::json!({
            "id": "chatcmpl-t",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Paris\"}"}}
            ]}, "finish_reason": null}]
        }))));
        events.extend(asm.on_chunk(&finish_chunk("tool_calls")));

        // Exactly one start/stop pair for the tool block
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStart { .. }))
            .count();
        let stops = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(stops, 1);

        let assembled = asm.assembled();
        assert_eq!(assembled.stop_reason, Some(StopReason::ToolUse));
        match &assembled.content[0] {
            ResponseBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_w");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Paris");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn test_text_block_closes_before_tool_opens() {
        let mut asm = StreamAssembler::new("m", 0);
        let mut events = Vec::new();

        events.extend(asm.on_chunk(&text_chunk("Let me check.")));
        // Chunk carrying both a text fragment and a new tool call: text
        // block must close first
        events.extend(asm.on_chunk(&chunk(serde_json::json!({
            "id": "chatcmpl-x",
            "choices": [{"index": 0, "delta": {
                "content": " one sec",
                "tool_calls": [
                    {"index": 0, "id": "call_1", "function": {"name": "lookup", "arguments": "{}"}}
                ]
            }, "finish_reason": null}]
        }))));
        events.extend(asm.on_chunk(&finish_chunk("tool_calls")));

        let sequence = names(&events);
        let text_stop = sequence
            .iter()
            .position(|n| *n == "content_block_stop")
            .unwrap();
        let tool_start = sequence
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == "content_block_start")
            .nth(1)
            .unwrap()
            .0;
        assert!(text_stop < tool_start);

        // Blocks carry distinct indices in emission order
        let assembled = asm.assembled();
        assert_eq!(assembled.content.len(), 2);
        assert!(matches!(assembled.content[0], ResponseBlock::Text { .. }));
        assert!(matches!(
            assembled.content[1],
            ResponseBlock::ToolUse { .. }
        ));
    }

    #[test]
    fn test_mid_stream_error_terminal_sequence() {
        let mut asm = StreamAssembler::new("m", 0);
        asm.on_chunk(&text_chunk("partial"));

        let events = asm.fail("upstream connection reset");
        assert_eq!(
            names(&events),
            vec![
                "content_block_stop",
                "error",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(asm.stop_reason(), Some(StopReason::Error));
        assert!(asm.is_finished());
    }

    #[test]
    fn test_stream_without_finish_reason_still_terminates() {
        let mut asm = StreamAssembler::new("m", 0);
        asm.on_chunk(&text_chunk("hi"));

        let events = asm.finish();
        assert!(names(&events).contains(&"message_stop"));
        assert!(asm.is_finished());

        // finish() after termination is a no-op
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn test_empty_stream_still_emits_full_envelope() {
        let mut asm = StreamAssembler::new("m", 2);
        let events = asm.finish();
        assert_eq!(
            names(&events),
            vec!["message_start", "ping", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn test_usage_from_trailing_chunk() {
        let mut asm = StreamAssembler::new("m", 5);
        asm.on_chunk(&text_chunk("Hello there"));
        asm.on_chunk(&finish_chunk("stop"));
        // OpenAI sends the usage chunk after finish_reason
        asm.on_chunk(&chunk(serde_json::json!({
            "id": "chatcmpl-s1",
            "choices": [],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7, "total_tokens": 49}
        })));

        assert_eq!(asm.usage(), (42, 7));
        let assembled = asm.assembled();
        assert_eq!(assembled.usage.input_tokens, 42);
        assert_eq!(assembled.usage.output_tokens, 7);
    }

    #[test]
    fn test_heuristic_usage_when_unreported() {
        let mut asm = StreamAssembler::new("m", 5);
        asm.on_chunk(&text_chunk("abcd"));
        asm.on_chunk(&finish_chunk("stop"));

        // input falls back to the request estimate, output to the
        // per-fragment heuristic (4 chars -> 1 token)
        assert_eq!(asm.usage(), (5, 1));
    }

    #[test]
    fn test_sse_wire_format() {
        let event = StreamEvent::ContentBlockStop { index: 0 };
        assert_eq!(
            event.to_sse(),
            "event: content_block_stop\ndata: {\"index\":0,\"type\":\"content_block_stop\"}\n\n"
        );

        let stop = StreamEvent::MessageStop;
        assert!(stop.to_sse().starts_with("event: message_stop\ndata: "));
        assert!(stop.to_sse().ends_with("\n\n"));
    }

    #[test]
    fn test_exactly_one_message_stop_when_finish_follows_error() {
        let mut asm = StreamAssembler::new("m", 0);
        asm.on_chunk(&text_chunk("x"));
        let failed = asm.fail("boom");
        let finished = asm.finish();

        let stops = failed
            .iter()
            .chain(finished.iter())
            .filter(|e| matches!(e, StreamEvent::MessageStop))
            .count();
        assert_eq!(stops, 1);
    }
}
