//! Claude → OpenAI request translation
//!
//! Converts Claude Messages requests to OpenAI Chat Completions format.
//!
//! # Key Differences
//!
//! | Claude                          | OpenAI                           |
//! |---------------------------------|----------------------------------|
//! | Top-level `system` field        | `messages[].role: "system"`      |
//! | `tool_use` content blocks       | assistant `tool_calls[]`         |
//! | `tool_result` content blocks    | `role: "tool"` messages          |
//! | `tool_choice: any`              | `tool_choice: "required"`        |
//! | `top_k`                         | (no equivalent, dropped)         |
//! | `stop_sequences` (array)        | `stop` (array)                   |

use crate::protocol::claude::{
    ClaudeRequest, ContentBlock, ImageSource, MessageContent, Role, Tool, ToolChoice,
};
use crate::protocol::openai::{
    ImageUrl, OpenAiChatRequest, OpenAiContent, OpenAiContentPart, OpenAiFunctionCall,
    OpenAiMessage, OpenAiTool, OpenAiToolCall, OpenAiToolChoice, StreamOptions,
    ToolChoiceFunction,
};

/// Configured ceiling and floor for the translated `max_tokens`
#[derive(Debug, Clone, Copy)]
pub struct TokenLimits {
    pub max: u32,
    pub min: u32,
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self { max: 16384, min: 1 }
    }
}

/// Translate a Claude request into the OpenAI chat-completions shape
pub fn claude_to_openai(
    req: &ClaudeRequest,
    concrete_model: &str,
    limits: &TokenLimits,
) -> OpenAiChatRequest {
    let mut messages: Vec<OpenAiMessage> = Vec::new();

    // Prepend system message if present; cache_control annotations are
    // dropped for OpenAI providers (native passthrough keeps them)
    if let Some(system) = &req.system {
        let text = system.flatten();
        if !text.is_empty() {
            messages.push(OpenAiMessage::text("system", text));
        }
    }

    for msg in &req.messages {
        messages.extend(convert_message(msg));
    }

    let streaming = req.is_streaming();

    OpenAiChatRequest {
        model: concrete_model.to_string(),
        messages,
        max_tokens: Some(req.max_tokens.clamp(limits.min, limits.max)),
        temperature: req.temperature,
        top_p: req.top_p,
        // top_k has no OpenAI equivalent and is dropped here
        stop: (!req.stop_sequences.is_empty()).then(|| req.stop_sequences.clone()),
        stream: streaming.then_some(true),
        stream_options: streaming.then_some(StreamOptions {
            include_usage: true,
        }),
        tools: (!req.tools.is_empty())
            .then(|| req.tools.iter().map(convert_tool).collect()),
        tool_choice: req.tool_choice.as_ref().map(convert_tool_choice),
        extra_query: None,
    }
}

/// Convert one Claude message into one or more OpenAI messages
///
/// A message carrying `tool_result` blocks splits: remaining text/image
/// blocks form a single message that precedes one `role: "tool"` message
/// per result. Assistant `tool_use` blocks collapse into a `tool_calls`
/// array on the main message.
fn convert_message(msg: &crate::protocol::claude::ClaudeMessage) -> Vec<OpenAiMessage> {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let blocks = match &msg.content {
        MessageContent::Text(text) => {
            return vec![OpenAiMessage::text(role, text.clone())];
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut messages: Vec<OpenAiMessage> = Vec::new();
    let mut text_parts: Vec<String> = Vec::new();
    let mut image_parts: Vec<OpenAiContentPart> = Vec::new();
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::Image { source } => {
                let url = match source {
                    ImageSource::Base64 { media_type, data } => {
                        format!("data:{media_type};base64,{data}")
                    }
                    ImageSource::Url { url } => url.clone(),
                };
                image_parts.push(OpenAiContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                messages.push(OpenAiMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAiContent::Text(flatten_tool_result(content.as_ref()))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            // Thinking blocks are not part of the OpenAI format
            ContentBlock::Thinking { .. } => {}
        }
    }

    // The main message (text/images and/or tool calls) precedes any tool
    // result messages
    if !text_parts.is_empty() || !image_parts.is_empty() || !tool_calls.is_empty() {
        let content = if !image_parts.is_empty() {
            let mut parts: Vec<OpenAiContentPart> = text_parts
                .into_iter()
                .map(|text| OpenAiContentPart::Text { text })
                .collect();
            parts.extend(image_parts);
            Some(OpenAiContent::Parts(parts))
        } else if !text_parts.is_empty() {
            Some(OpenAiContent::Text(text_parts.join("")))
        } else {
            None
        };

        messages.insert(
            0,
            OpenAiMessage {
                role: role.to_string(),
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            },
        );
    }

    // A message whose blocks all vanished (e.g. thinking-only) still needs
    // a placeholder to keep the conversation alternation valid
    if messages.is_empty() {
        messages.push(OpenAiMessage::text(role, String::new()));
    }

    messages
}

/// Flatten a tool result's content (string or block list) to plain text
fn flatten_tool_result(content: Option<&serde_json::Value>) -> String {
    match content {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| {
                (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| b.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

/// Convert a Claude tool into an OpenAI function definition; the JSON
/// schema carries over verbatim
fn convert_tool(tool: &Tool) -> OpenAiTool {
    OpenAiTool::function(
        tool.name.clone(),
        tool.description.clone(),
        tool.input_schema.clone(),
    )
}

fn convert_tool_choice(choice: &ToolChoice) -> OpenAiToolChoice {
    match choice {
        ToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => OpenAiToolChoice::Mode("required".to_string()),
        ToolChoice::None => OpenAiToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name } => OpenAiToolChoice::Specific {
            choice_type: "function".to_string(),
            function: ToolChoiceFunction { name: name.clone() },
        },
    }
}
