//! DeepSeek tool-use amplifier
//!
//! DeepSeek models under-use tools when left in auto mode. This transformer
//! forces tool choice whenever tools are present and injects a synthetic
//! `ExitTool` so the model can still answer in plain text: calling
//! `ExitTool(response)` is rewritten back into an ordinary assistant text
//! turn before translation.
//!
//! It also extracts fenced ```json blocks from text answers, since these
//! models like to wrap structured output in markdown fences.

use super::{HookContext, Transformer};
use crate::protocol::claude::{ClaudeResponse, ResponseBlock};
use crate::protocol::openai::{
    OpenAiChatCompletion, OpenAiChatRequest, OpenAiMessage, OpenAiStreamChunk, OpenAiTool,
    OpenAiToolChoice,
};
use crate::translate::{Delta, StreamEvent};
use regex::Regex;
use std::sync::OnceLock;

/// Name of the synthetic escape-hatch tool
pub const EXIT_TOOL: &str = "ExitTool";

const DEFAULT_MAX_OUTPUT: u32 = 8192;

const FORCED_TOOL_REMINDER: &str = "You must call a tool in your response. \
If none of the domain tools fit, call ExitTool with your complete answer \
as the response argument.";

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.+?)\s*```").expect("valid fence regex"))
}

/// If `text` contains a fenced ```json block that parses, return the
/// extracted JSON string
fn extract_fenced_json(text: &str) -> Option<String> {
    let captures = fence_regex().captures(text)?;
    let candidate = captures.get(1)?.as_str();
    serde_json::from_str::<serde_json::Value>(candidate)
        .ok()
        .map(|_| candidate.to_string())
}

/// Per-request scratch for the streaming ExitTool rewrite
#[derive(Default, serde::Serialize, serde::Deserialize)]
struct ExitToolState {
    active: bool,
    openai_index: usize,
    arguments: String,
}

fn load_state(scratch: &serde_json::Value) -> ExitToolState {
    serde_json::from_value(scratch.clone()).unwrap_or_default()
}

fn store_state(scratch: &mut serde_json::Value, state: &ExitToolState) {
    *scratch = serde_json::to_value(state).unwrap_or(serde_json::Value::Null);
}

/// Pull the `response` argument out of an ExitTool call's arguments
fn exit_tool_response(arguments: &str) -> String {
    serde_json::from_str::<serde_json::Value>(arguments)
        .ok()
        .and_then(|v| v.get("response").and_then(|r| r.as_str()).map(String::from))
        .unwrap_or_else(|| arguments.to_string())
}

pub struct DeepSeekToolMode;

impl Transformer for DeepSeekToolMode {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    fn request_out(
        &self,
        mut req: OpenAiChatRequest,
        ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> OpenAiChatRequest {
        let max_output = ctx
            .options
            .get("max_output")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_MAX_OUTPUT);
        req.max_tokens = Some(req.max_tokens.unwrap_or(max_output).min(max_output));

        let has_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
        if !has_tools {
            return req;
        }

        req.tool_choice = Some(OpenAiToolChoice::Mode("required".to_string()));

        if let Some(tools) = &mut req.tools {
            tools.push(OpenAiTool::function(
                EXIT_TOOL,
                Some("Exit tool mode and reply with plain text.".to_string()),
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "response": {
                            "type": "string",
                            "description": "The complete plain-text answer."
                        }
                    },
                    "required": ["response"]
                }),
            ));
        }

        req.messages
            .insert(0, OpenAiMessage::text("system", FORCED_TOOL_REMINDER));

        req
    }

    fn response_in(
        &self,
        mut resp: OpenAiChatCompletion,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> OpenAiChatCompletion {
        for choice in &mut resp.choices {
            let exit_call = choice
                .message
                .tool_calls
                .as_ref()
                .and_then(|calls| calls.iter().find(|tc| tc.function.name == EXIT_TOOL))
                .map(|tc| tc.function.arguments.clone());

            if let Some(arguments) = exit_call {
                choice.message.content = Some(exit_tool_response(&arguments));
                choice.message.tool_calls = None;
                choice.finish_reason = Some("stop".to_string());
            }
        }
        resp
    }

    fn chunk_in(
        &self,
        mut chunk: OpenAiStreamChunk,
        _ctx: &HookContext,
        scratch: &mut serde_json::Value,
    ) -> OpenAiStreamChunk {
        let mut state = load_state(scratch);

        for choice in &mut chunk.choices {
            if let Some(tool_calls) = choice.delta.tool_calls.take() {
                let mut passthrough = Vec::new();
                for tc in tool_calls {
                    let opens_exit = tc
                        .function
                        .as_ref()
                        .and_then(|f| f.name.as_deref())
                        .map(|n| n == EXIT_TOOL)
                        .unwrap_or(false);

                    if opens_exit {
                        state.active = true;
                        state.openai_index = tc.index;
                        if let Some(args) =
                            tc.function.as_ref().and_then(|f| f.arguments.as_deref())
                        {
                            state.arguments.push_str(args);
                        }
                    } else if state.active && tc.index == state.openai_index {
                        if let Some(args) =
                            tc.function.as_ref().and_then(|f| f.arguments.as_deref())
                        {
                            state.arguments.push_str(args);
                        }
                    } else {
                        passthrough.push(tc);
                    }
                }
                if !passthrough.is_empty() {
                    choice.delta.tool_calls = Some(passthrough);
                }
            }

            if state.active && choice.finish_reason.as_deref() == Some("tool_calls") {
                // The suppressed ExitTool call becomes a text turn
                choice.delta.content = Some(exit_tool_response(&state.arguments));
                choice.finish_reason = Some("stop".to_string());
            }
        }

        store_state(scratch, &state);
        chunk
    }

    fn response_out(
        &self,
        mut resp: ClaudeResponse,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> ClaudeResponse {
        for block in &mut resp.content {
            if let ResponseBlock::Text { text } = block {
                if let Some(extracted) = extract_fenced_json(text) {
                    *text = extracted;
                }
            }
        }
        resp
    }

    fn event_out(
        &self,
        event: StreamEvent,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> StreamEvent {
        // Already-emitted deltas cannot be rewritten, so only a fence that
        // arrives whole inside one delta is extracted
        if let StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::Text { text },
        } = &event
        {
            if let Some(extracted) = extract_fenced_json(text) {
                return StreamEvent::ContentBlockDelta {
                    index: *index,
                    delta: Delta::Text { text: extracted },
                };
            }
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::claude::StopReason;
    use crate::translate::{claude_to_openai, openai_to_claude, TokenLimits};

    fn hook_ctx(options: &serde_json::Value) -> HookContext<'_> {
        HookContext {
            provider: "deepseek",
            model: "deepseek-chat",
            options,
        }
    }

    fn weather_request() -> OpenAiChatRequest {
        let req: crate::protocol::claude::ClaudeRequest =
            serde_json::from_value(serde_json::json!({
                "model": "claude-sonnet-4-20250514",
                "max_tokens": 32000,
                "tools": [{
                    "name": "get_weather",
                    "input_schema": {
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "required": ["city"]
                    }
                }],
                "messages": [{"role": "user", "content": "Weather in Paris?"}]
            }))
            .unwrap();
        claude_to_openai(&req, "deepseek-chat", &TokenLimits { max: 32000, min: 1 })
    }

    #[test]
    fn test_request_out_forces_tools_and_injects_exit_tool() {
        let options = serde_json::json!({});
        let mut scratch = serde_json::Value::Null;

        let out = DeepSeekToolMode.request_out(weather_request(), &hook_ctx(&options), &mut scratch);

        assert_eq!(
            out.tool_choice,
            Some(OpenAiToolChoice::Mode("required".to_string()))
        );
        let tools = out.tools.as_ref().unwrap();
        assert!(tools.iter().any(|t| t.function.name == EXIT_TOOL));
        assert_eq!(out.messages[0].role, "system");
        // max_tokens clamped to the default max_output
        assert_eq!(out.max_tokens, Some(8192));
    }

    #[test]
    fn test_request_out_honors_max_output_option() {
        let options = serde_json::json!({"max_output": 4096});
        let mut scratch = serde_json::Value::Null;

        let out = DeepSeekToolMode.request_out(weather_request(), &hook_ctx(&options), &mut scratch);
        assert_eq!(out.max_tokens, Some(4096));
    }

    #[test]
    fn test_request_without_tools_untouched() {
        let req: crate::protocol::claude::ClaudeRequest =
            serde_json::from_value(serde_json::json!({
                "model": "claude-sonnet-4-20250514",
                "max_tokens": 100,
                "messages": [{"role": "user", "content": "Hi"}]
            }))
            .unwrap();
        let openai = claude_to_openai(&req, "deepseek-chat", &TokenLimits::default());

        let options = serde_json::json!({});
        let mut scratch = serde_json::Value::Null;
        let out = DeepSeekToolMode.request_out(openai, &hook_ctx(&options), &mut scratch);

        assert!(out.tool_choice.is_none());
        assert!(out.tools.is_none());
        assert_eq!(out.messages[0].role, "user");
    }

    #[test]
    fn test_exit_tool_call_becomes_text_turn() {
        let resp: OpenAiChatCompletion = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-e",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_exit",
                        "type": "function",
                        "function": {
                            "name": EXIT_TOOL,
                            "arguments": "{\"response\":\"no tool needed\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();

        let options = serde_json::json!({});
        let mut scratch = serde_json::Value::Null;
        let rewritten = DeepSeekToolMode.response_in(resp, &hook_ctx(&options), &mut scratch);

        let claude = openai_to_claude(&rewritten, "claude-sonnet-4-20250514", 0);
        assert_eq!(claude.text(), "no tool needed");
        assert_eq!(claude.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(claude.content.len(), 1);
    }

    #[test]
    fn test_streaming_exit_tool_rewrite() {
        let options = serde_json::json!({});
        let mut scratch = serde_json::Value::Null;
        let ctx = hook_ctx(&options);

        let open: OpenAiStreamChunk = serde_json::from_value(serde_json::json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_e", "function": {"name": EXIT_TOOL, "arguments": ""}}
            ]}, "finish_reason": null}]
        }))
        .unwrap();
        let out = DeepSeekToolMode.chunk_in(open, &ctx, &mut scratch);
        // The ExitTool call never reaches the state machine
        assert!(out.choices[0].delta.tool_calls.is_none());

        let args: OpenAiStreamChunk = serde_json::from_value(serde_json::json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"response\":\"plain answer\"}"}}
            ]}, "finish_reason": null}]
        }))
        .unwrap();
        DeepSeekToolMode.chunk_in(args, &ctx, &mut scratch);

        let finish: OpenAiStreamChunk = serde_json::from_value(serde_json::json!({
            "id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]
        }))
        .unwrap();
        let out = DeepSeekToolMode.chunk_in(finish, &ctx, &mut scratch);

        assert_eq!(out.choices[0].delta.content.as_deref(), Some("plain answer"));
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_fenced_json_extraction() {
        assert_eq!(
            extract_fenced_json("Here you go:\n```json\n{\"a\": 1}\n```\nDone."),
            Some("{\"a\": 1}".to_string())
        );
        // Invalid JSON inside the fence stays untouched
        assert_eq!(extract_fenced_json("```json\nnot json\n```"), None);
        assert_eq!(extract_fenced_json("no fences here"), None);
    }

    #[test]
    fn test_response_out_replaces_fenced_block() {
        let resp = ClaudeResponse {
            id: "msg_1".to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            model: "m".to_string(),
            content: vec![ResponseBlock::Text {
                text: "```json\n{\"result\": 42}\n```".to_string(),
            }],
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: Default::default(),
        };

        let options = serde_json::json!({});
        let mut scratch = serde_json::Value::Null;
        let out = DeepSeekToolMode.response_out(resp, &hook_ctx(&options), &mut scratch);
        assert_eq!(out.text(), "{\"result\": 42}");
    }
}
