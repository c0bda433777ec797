//! Protocol translation between Claude and OpenAI wire formats
//!
//! Three directions:
//! - `request`: Claude `messages` request → OpenAI chat completions request
//! - `response`: buffered OpenAI completion → Claude `Message`
//! - `stream`: incremental OpenAI chunks → Claude SSE event sequence plus
//!   the assembled `Message` for history
//!
//! Native Anthropic providers bypass this module entirely; their bodies are
//! forwarded untouched.

pub mod request;
pub mod response;
pub mod stream;

pub use request::{claude_to_openai, TokenLimits};
pub use response::{map_finish_reason, openai_to_claude};
pub use stream::{BlockStart, Delta, StreamAssembler, StreamEvent};
