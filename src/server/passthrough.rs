//! Native-Anthropic stream accounting
//!
//! Passthrough streams are forwarded byte-for-byte, but the history row
//! still needs the assembled response, usage, and terminal status. This
//! assembler watches the frames as they pass and reconstructs the message
//! by applying deltas in order.

use crate::protocol::claude::{ClaudeResponse, ResponseBlock, StopReason, Usage};
use crate::translate::response::parse_arguments;

#[derive(Debug, Default)]
struct PartialBlock {
    block_type: String,
    id: String,
    name: String,
    text: String,
    partial_json: String,
}

/// Reconstructs a Claude `Message` from a passing SSE event stream
#[derive(Debug, Default)]
pub struct PassthroughAssembler {
    message_id: String,
    model: String,
    blocks: Vec<PartialBlock>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
    saw_message_stop: bool,
}

impl PassthroughAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.saw_message_stop
    }

    pub fn usage(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Observe one raw SSE frame (possibly several lines)
    pub fn observe(&mut self, frame: &str) {
        for line in frame.lines() {
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
                continue;
            };
            self.observe_event(&event);
        }
    }

    fn observe_event(&mut self, event: &serde_json::Value) {
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    self.message_id = str_field(message, "id");
                    self.model = str_field(message, "model");
                    if let Some(usage) = message.get("usage") {
                        self.input_tokens = u32_field(usage, "input_tokens");
                    }
                }
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                while self.blocks.len() <= index {
                    self.blocks.push(PartialBlock::default());
                }
                if let Some(block) = event.get("content_block") {
                    let slot = &mut self.blocks[index];
                    slot.block_type = str_field(block, "type");
                    slot.id = str_field(block, "id");
                    slot.name = str_field(block, "name");
                    slot.text = str_field(block, "text");
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let Some(slot) = self.blocks.get_mut(index) else {
                    return;
                };
                if let Some(delta) = event.get("delta") {
                    match delta.get("type").and_then(|t| t.as_str()) {
                        Some("text_delta") => slot.text.push_str(&str_field(delta, "text")),
                        Some("input_json_delta") => {
                            slot.partial_json.push_str(&str_field(delta, "partial_json"))
                        }
                        Some("thinking_delta") => {
                            slot.text.push_str(&str_field(delta, "thinking"))
                        }
                        _ => {}
                    }
                }
            }
            Some("message_delta") => {
                if let Some(delta) = event.get("delta") {
                    if let Some(reason) = delta.get("stop_reason").and_then(|r| r.as_str()) {
                        self.stop_reason = Some(reason.to_string());
                    }
                }
                if let Some(usage) = event.get("usage") {
                    let output = u32_field(usage, "output_tokens");
                    if output > 0 {
                        self.output_tokens = output;
                    }
                }
            }
            Some("message_stop") => self.saw_message_stop = true,
            _ => {}
        }
    }

    /// The reconstructed message for the history row
    pub fn assembled(&self) -> ClaudeResponse {
        let content = self
            .blocks
            .iter()
            .filter_map(|block| match block.block_type.as_str() {
                "text" | "thinking" => Some(ResponseBlock::Text {
                    text: block.text.clone(),
                }),
                "tool_use" => Some(ResponseBlock::ToolUse {
                    id: block.id.clone(),
                    name: block.name.clone(),
                    input: parse_arguments(&block.partial_json),
                }),
                _ => None,
            })
            .collect();

        let stop_reason = match self.stop_reason.as_deref() {
            Some("end_turn") => Some(StopReason::EndTurn),
            Some("max_tokens") => Some(StopReason::MaxTokens),
            Some("stop_sequence") => Some(StopReason::StopSequence),
            Some("tool_use") => Some(StopReason::ToolUse),
            Some("error") => Some(StopReason::Error),
            _ => None,
        };

        ClaudeResponse {
            id: self.message_id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model.clone(),
            content,
            stop_reason,
            stop_sequence: None,
            usage: Usage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
        }
    }
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn u32_field(value: &serde_json::Value, key: &str) -> u32 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0) as u32
}
