//! Transformer pipeline for provider-specific request/response fixups
//!
//! Transformers mutate the in-flight exchange at four hooks:
//!
//! 1. `request_in` — the Claude request, before protocol translation
//! 2. `request_out` — the OpenAI request, after translation, before dispatch
//! 3. `response_in` — the raw OpenAI response (per chunk when streaming)
//! 4. `response_out` — the Claude response (per event when streaming)
//!
//! Transformers are registered in an explicit table keyed by name and
//! selected per request by matching the resolved `(provider, model)` against
//! glob predicates. Execution order is configuration order.
//!
//! The trait objects are stateless and shared; per-request state (needed by
//! streaming hooks) lives in a scratch value owned by the matched stack.

mod deepseek;
mod openrouter;
mod tool_reminder;

pub use deepseek::DeepSeekToolMode;
pub use openrouter::OpenRouterCacheControl;
pub use tool_reminder::ToolUseReminder;

use crate::config::TransformerConfig;
use crate::protocol::claude::{ClaudeRequest, ClaudeResponse};
use crate::protocol::openai::{OpenAiChatCompletion, OpenAiChatRequest, OpenAiStreamChunk};
use crate::translate::StreamEvent;
use std::sync::Arc;

/// Context handed to every hook invocation
pub struct HookContext<'a> {
    /// Resolved provider name (part of the hook API; the shipped
    /// transformers scope themselves via predicates instead)
    #[allow(dead_code)]
    pub provider: &'a str,
    /// Resolved concrete model
    #[allow(dead_code)]
    pub model: &'a str,
    /// This transformer's free-form config options
    pub options: &'a serde_json::Value,
}

/// A pipeline transformer
///
/// Every hook has an identity default; implementations override only the
/// hooks they care about. Hooks must be deterministic and must not touch
/// anything beyond the value they are given and their scratch state.
pub trait Transformer: Send + Sync {
    /// Registry name, matched against `[transformers.<name>]`
    fn name(&self) -> &'static str;

    fn request_in(
        &self,
        req: ClaudeRequest,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> ClaudeRequest {
        req
    }

    fn request_out(
        &self,
        req: OpenAiChatRequest,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> OpenAiChatRequest {
        req
    }

    fn response_in(
        &self,
        resp: OpenAiChatCompletion,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> OpenAiChatCompletion {
        resp
    }

    /// Streaming variant of `response_in`, applied to each chunk
    fn chunk_in(
        &self,
        chunk: OpenAiStreamChunk,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> OpenAiStreamChunk {
        chunk
    }

    fn response_out(
        &self,
        resp: ClaudeResponse,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> ClaudeResponse {
        resp
    }

    /// Streaming variant of `response_out`, applied to each emitted event
    fn event_out(
        &self,
        event: StreamEvent,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> StreamEvent {
        event
    }

    /// `response_out` for native-Anthropic passthrough streams: raw SSE
    /// frames, one whole event per call
    fn passthrough_out(
        &self,
        frame: String,
        _ctx: &HookContext,
        _scratch: &mut serde_json::Value,
    ) -> String {
        frame
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

struct RegistryEntry {
    config: TransformerConfig,
    transformer: Arc<dyn Transformer>,
}

/// Ordered table of enabled transformers, built once from config
pub struct TransformerRegistry {
    entries: Vec<RegistryEntry>,
}

impl TransformerRegistry {
    /// Build from config, in config order. Unknown names are skipped with a
    /// warning rather than failing startup.
    pub fn from_config(configs: &[TransformerConfig]) -> Self {
        let mut entries = Vec::new();
        for config in configs {
            if !config.enabled {
                tracing::debug!("Transformer {} disabled", config.name);
                continue;
            }
            let transformer: Arc<dyn Transformer> = match config.name.as_str() {
                "deepseek" => Arc::new(DeepSeekToolMode),
                "openrouter" => Arc::new(OpenRouterCacheControl),
                "tool_reminder" => Arc::new(ToolUseReminder),
                other => {
                    tracing::warn!("Unknown transformer {other:?} in config, skipping");
                    continue;
                }
            };
            tracing::info!(
                "Registered transformer {} (providers={:?}, models={:?})",
                config.name,
                config.providers,
                config.models
            );
            entries.push(RegistryEntry {
                config: config.clone(),
                transformer,
            });
        }
        Self { entries }
    }

    /// Select the transformers whose predicates match, in registry order
    pub fn stack_for(&self, provider: &str, model: &str) -> TransformerStack {
        let entries = self
            .entries
            .iter()
            .filter(|e| predicate_matches(&e.config, provider, model))
            .map(|e| StackEntry {
                transformer: e.transformer.clone(),
                options: e.config.options.clone(),
                scratch: serde_json::Value::Null,
            })
            .collect();
        TransformerStack {
            provider: provider.to_string(),
            model: model.to_string(),
            entries,
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Predicate: any provider glob matches (case-insensitive) AND any model
/// glob matches ("*" matches all)
fn predicate_matches(config: &TransformerConfig, provider: &str, model: &str) -> bool {
    let provider_ok = config
        .providers
        .iter()
        .any(|p| glob_match_ci(p, provider));
    let model_ok = config
        .models
        .iter()
        .any(|m| m == "*" || fast_glob::glob_match(m, model));
    provider_ok && model_ok
}

fn glob_match_ci(pattern: &str, value: &str) -> bool {
    pattern.eq_ignore_ascii_case(value)
        || fast_glob::glob_match(pattern.to_lowercase(), value.to_lowercase())
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-request stack
// ─────────────────────────────────────────────────────────────────────────────

struct StackEntry {
    transformer: Arc<dyn Transformer>,
    options: serde_json::Value,
    scratch: serde_json::Value,
}

/// The transformers matched for one request, with their per-request state
pub struct TransformerStack {
    provider: String,
    model: String,
    entries: Vec<StackEntry>,
}

macro_rules! run_hook {
    ($self:ident, $hook:ident, $value:expr) => {{
        let mut current = $value;
        for entry in &mut $self.entries {
            let ctx = HookContext {
                provider: &$self.provider,
                model: &$self.model,
                options: &entry.options,
            };
            current = entry.transformer.$hook(current, &ctx, &mut entry.scratch);
        }
        current
    }};
}

impl TransformerStack {
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn request_in(&mut self, req: ClaudeRequest) -> ClaudeRequest {
        run_hook!(self, request_in, req)
    }

    pub fn request_out(&mut self, req: OpenAiChatRequest) -> OpenAiChatRequest {
        run_hook!(self, request_out, req)
    }

    pub fn response_in(&mut self, resp: OpenAiChatCompletion) -> OpenAiChatCompletion {
        run_hook!(self, response_in, resp)
    }

    pub fn chunk_in(&mut self, chunk: OpenAiStreamChunk) -> OpenAiStreamChunk {
        run_hook!(self, chunk_in, chunk)
    }

    pub fn response_out(&mut self, resp: ClaudeResponse) -> ClaudeResponse {
        run_hook!(self, response_out, resp)
    }

    pub fn event_out(&mut self, event: StreamEvent) -> StreamEvent {
        run_hook!(self, event_out, event)
    }

    pub fn passthrough_out(&mut self, frame: String) -> String {
        run_hook!(self, passthrough_out, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, providers: &[&str], models: &[&str]) -> TransformerConfig {
        TransformerConfig {
            name: name.to_string(),
            enabled: true,
            providers: providers.iter().map(|s| s.to_string()).collect(),
            models: models.iter().map(|s| s.to_string()).collect(),
            options: serde_json::json!({}),
        }
    }

    #[test]
    fn test_predicate_exact_match_is_case_insensitive() {
        let c = config("deepseek", &["DeepSeek"], &["*"]);
        assert!(predicate_matches(&c, "deepseek", "deepseek-chat"));
        assert!(predicate_matches(&c, "DEEPSEEK", "anything"));
        assert!(!predicate_matches(&c, "openai", "deepseek-chat"));
    }

    #[test]
    fn test_predicate_globs() {
        let c = config("deepseek", &["deepseek*"], &["deepseek-*"]);
        assert!(predicate_matches(&c, "deepseek-beta", "deepseek-chat"));
        assert!(!predicate_matches(&c, "deepseek-beta", "gpt-4o"));

        let wildcard = config("tool_reminder", &["*"], &["*"]);
        assert!(predicate_matches(&wildcard, "anyone", "anything"));
    }

    #[test]
    fn test_registry_skips_disabled_and_unknown() {
        let mut disabled = config("deepseek", &["*"], &["*"]);
        disabled.enabled = false;
        let unknown = config("does-not-exist", &["*"], &["*"]);
        let enabled = config("openrouter", &["openrouter"], &["*"]);

        let registry = TransformerRegistry::from_config(&[disabled, unknown, enabled]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stack_selection_by_provider() {
        let registry = TransformerRegistry::from_config(&[
            config("deepseek", &["deepseek"], &["*"]),
            config("tool_reminder", &["*"], &["*"]),
        ]);

        let stack = registry.stack_for("deepseek", "deepseek-chat");
        assert_eq!(stack.entries.len(), 2);

        let stack = registry.stack_for("OpenAI", "gpt-4o-mini");
        assert_eq!(stack.entries.len(), 1);
    }

    #[test]
    fn test_empty_stack_passthrough() {
        let registry = TransformerRegistry::from_config(&[]);
        let mut stack = registry.stack_for("OpenAI", "gpt-4o-mini");
        assert!(stack.is_empty());

        let req: ClaudeRequest = serde_json::from_value(serde_json::json!({
            "model": "m", "max_tokens": 10,
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .unwrap();
        let out = stack.request_in(req.clone());
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            serde_json::to_value(&req).unwrap()
        );
    }
}
