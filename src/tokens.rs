//! Token estimation for Claude API content
//!
//! Character-based approximation: one token per four characters, rounded up.
//! Used by the count_tokens endpoint and as a back-fill when an upstream
//! response or stream carries no `usage` field.
//!
//! This is an *estimator*, not an exact counter. For exact counts, use the
//! API's `usage` response field.

use crate::protocol::claude::{ClaudeRequest, ContentBlock, MessageContent, SystemPrompt};

/// Estimate token count for text content
///
/// # Returns
/// `ceil(chars / 4)`, minimum 1 for non-empty input, 0 for empty input.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as u32;
    chars.div_ceil(4).max(1)
}

/// Estimate tokens for a JSON value over its compact serialization
pub fn estimate_json_tokens(json: &serde_json::Value) -> u32 {
    estimate_tokens(&json.to_string())
}

/// Estimate the input token count of a full Claude request
///
/// Sums the system prompt, every message block, and the serialized tool
/// definitions. Image blocks count a flat overhead rather than their base64
/// payload length.
pub fn estimate_request_tokens(req: &ClaudeRequest) -> u32 {
    let mut total = 0u32;

    match &req.system {
        Some(SystemPrompt::Text(text)) => total += estimate_tokens(text),
        Some(SystemPrompt::Blocks(blocks)) => {
            for block in blocks {
                total += estimate_tokens(&block.text);
            }
        }
        None => {}
    }

    for msg in &req.messages {
        match &msg.content {
            MessageContent::Text(text) => total += estimate_tokens(text),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    total += estimate_block_tokens(block);
                }
            }
        }
    }

    for tool in &req.tools {
        total += estimate_tokens(&tool.name);
        if let Some(desc) = &tool.description {
            total += estimate_tokens(desc);
        }
        total += estimate_json_tokens(&tool.input_schema);
    }

    total
}

/// Flat token overhead charged per image block
const IMAGE_TOKEN_OVERHEAD: u32 = 1500;

fn estimate_block_tokens(block: &ContentBlock) -> u32 {
    match block {
        ContentBlock::Text { text } => estimate_tokens(text),
        ContentBlock::Image { .. } => IMAGE_TOKEN_OVERHEAD,
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_tokens(name) + estimate_json_tokens(input)
        }
        ContentBlock::ToolResult { content, .. } => {
            content.as_ref().map(estimate_json_tokens).unwrap_or(0)
        }
        ContentBlock::Thinking { thinking } => estimate_tokens(thinking),
    }
}
