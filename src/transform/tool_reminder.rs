//! Generic tool-use reminder
//!
//! Appends a one-line system reminder encouraging tool use whenever the
//! request carries tools. Some models ignore their tool palette without a
//! nudge; this is the mild version of what the DeepSeek transformer does
//! forcefully.

use super::{HookContext, Transformer};
use crate::protocol::claude::{ClaudeRequest, SystemBlock, SystemPrompt};

const DEFAULT_REMINDER: &str =
    "Prefer calling one of the available tools when it can answer the request.";

pub struct ToolUseReminder;

impl Transformer for ToolUseReminder {
    fn name(&self) -> &'static str {
        "tool_reminder"
    }

    fn request_in(
        &self,
        mut req: ClaudeRequest,
        ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> ClaudeRequest {
        if req.tools.is_empty() {
            return req;
        }

        let reminder = ctx
            .options
            .get("reminder")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_REMINDER)
            .to_string();

        req.system = Some(match req.system.take() {
            None => SystemPrompt::Text(reminder),
            Some(SystemPrompt::Text(existing)) => {
                SystemPrompt::Text(format!("{existing}\n{reminder}"))
            }
            Some(SystemPrompt::Blocks(mut blocks)) => {
                blocks.push(SystemBlock::text(reminder));
                SystemPrompt::Blocks(blocks)
            }
        });

        req
    }
}
