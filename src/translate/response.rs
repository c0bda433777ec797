//! OpenAI → Claude buffered response translation
//!
//! Maps a complete OpenAI `ChatCompletion` to a Claude `Message`. Streaming
//! responses go through `stream::StreamAssembler` instead.

use crate::protocol::claude::{ClaudeResponse, ResponseBlock, StopReason, Usage};
use crate::protocol::openai::OpenAiChatCompletion;
use crate::tokens::estimate_tokens;

/// Convert a buffered OpenAI completion to a Claude `Message`
///
/// `claimed_model` is echoed back so the client sees the model it asked
/// for. `estimated_input` backs the usage fields when the upstream omits
/// them, keeping `total = input + output` intact.
pub fn openai_to_claude(
    resp: &OpenAiChatCompletion,
    claimed_model: &str,
    estimated_input: u32,
) -> ClaudeResponse {
    let choice = resp.choices.first();
    let mut content: Vec<ResponseBlock> = Vec::new();

    if let Some(choice) = choice {
        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(ResponseBlock::Text { text: text.clone() });
            }
        }

        if let Some(tool_calls) = &choice.message.tool_calls {
            for tc in tool_calls {
                content.push(ResponseBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input: parse_arguments(&tc.function.arguments),
                });
            }
        }
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(map_finish_reason);

    let usage = match &resp.usage {
        Some(u) => Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        },
        None => Usage {
            input_tokens: estimated_input,
            output_tokens: estimate_output(&content),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        },
    };

    ClaudeResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: claimed_model.to_string(),
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

/// Parse a tool call's JSON argument string.
///
/// On parse failure the raw string survives under a `_raw` key; the failure
/// is a soft error so the client still sees the call.
pub fn parse_arguments(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Unparseable tool_call arguments ({e}); preserving raw string");
            serde_json::json!({ "_raw": arguments })
        }
    }
}

/// Map an OpenAI `finish_reason` to a Claude `stop_reason`
pub fn map_finish_reason(finish_reason: &str) -> StopReason {
    match finish_reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" => StopReason::ToolUse,
        "content_filter" => {
            tracing::warn!("Upstream finished with content_filter");
            StopReason::EndTurn
        }
        other => {
            tracing::debug!("Unrecognized finish_reason {other:?}, mapping to end_turn");
            StopReason::EndTurn
        }
    }
}

/// Heuristic output estimate over the assembled content
pub fn estimate_output(content: &[ResponseBlock]) -> u32 {
    content
        .iter()
        .map(|block| match block {
            ResponseBlock::Text { text } => estimate_tokens(text),
            ResponseBlock::ToolUse { input, .. } => {
                crate::tokens::estimate_json_tokens(input)
            }
        })
        .sum()
}

fn message_id(openai_id: &str) -> String {
    if openai_id.is_empty() {
        "msg_unknown".to_string()
    } else {
        format!("msg_{}", openai_id.trim_start_matches("chatcmpl-"))
    }
}
