//! Wire types for the two API protocols the proxy speaks
//!
//! `claude` holds the Anthropic Messages API shapes (requests arrive and
//! responses leave in this format), `openai` the Chat Completions shapes
//! (what OpenAI-compatible upstreams consume and produce).
//!
//! Content blocks are modeled as tagged sums rather than free-form maps so
//! the translator can switch on the variant. Deserialization is permissive:
//! unknown fields are ignored and optional fields default, keeping the proxy
//! robust to API additions.

pub mod claude;
pub mod openai;
