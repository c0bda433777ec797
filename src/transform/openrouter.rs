//! OpenRouter cache-control injection
//!
//! OpenRouter accepts prompt-cache hints through a request extension object.
//! This transformer attaches the configured `cache_control` settings to
//! every outbound request for matching providers.

use super::{HookContext, Transformer};
use crate::protocol::openai::OpenAiChatRequest;

fn default_cache_control() -> serde_json::Value {
    serde_json::json!({"ttl": 3600, "refresh": "force"})
}

pub struct OpenRouterCacheControl;

impl Transformer for OpenRouterCacheControl {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn request_out(
        &self,
        mut req: OpenAiChatRequest,
        ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> OpenAiChatRequest {
        let cache_control = ctx
            .options
            .get("cache_control")
            .cloned()
            .unwrap_or_else(default_cache_control);

        let extra = req
            .extra_query
            .get_or_insert_with(|| serde_json::json!({}));
        if let Some(obj) = extra.as_object_mut() {
            obj.insert("cache_control".to_string(), cache_control);
        }

        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::openai::OpenAiMessage;

    fn request() -> OpenAiChatRequest {
        OpenAiChatRequest {
            model: "anthropic/claude-sonnet-4".to_string(),
            messages: vec![OpenAiMessage::text("user", "Hi")],
            max_tokens: Some(64),
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            stream_options: None,
            tools: None,
            tool_choice: None,
            extra_query: None,
        }
    }

    #[test]
    fn test_attaches_configured_cache_control() {
        let options = serde_json::json!({"cache_control": {"ttl": 600, "refresh": "auto"}});
        let ctx = HookContext {
            provider: "openrouter",
            model: "anthropic/claude-sonnet-4",
            options: &options,
        };
        let mut scratch = serde_json::Value::Null;

        let out = OpenRouterCacheControl.request_out(request(), &ctx, &mut scratch);
        let extra = out.extra_query.unwrap();
        assert_eq!(extra["cache_control"]["ttl"], 600);
        assert_eq!(extra["cache_control"]["refresh"], "auto");
    }

    #[test]
    fn test_defaults_when_unconfigured() {
        let options = serde_json::json!({});
        let ctx = HookContext {
            provider: "openrouter",
            model: "m",
            options: &options,
        };
        let mut scratch = serde_json::Value::Null;

        let out = OpenRouterCacheControl.request_out(request(), &ctx, &mut scratch);
        assert_eq!(out.extra_query.unwrap()["cache_control"]["ttl"], 3600);
    }
}
