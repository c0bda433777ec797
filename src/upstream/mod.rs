//! Upstream provider client
//!
//! Two modes:
//! - **OpenAI-compatible**: `POST {base_url}/chat/completions`, buffered or
//!   as an SSE chunk stream terminated by `[DONE]`.
//! - **Native Anthropic**: `POST {base_url}/v1/messages` with the original
//!   Claude body; only endpoint and auth are rewritten.
//!
//! Connect/timeout failures and 408/425/429 responses are retried within a
//! configured budget; a 429 Retry-After is honored once. Other 4xx are
//! never retried, and nothing is retried after the first streamed byte.
//!
//! The authorization header value is never logged.

mod sse;

pub use sse::{SseChunkStream, SseEventStream};

use crate::config::ProviderConfig;
use crate::protocol::openai::{OpenAiChatCompletion, OpenAiChatRequest};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Upstream failure kinds, mapped to the proxy error taxonomy by the server
#[derive(Debug)]
pub enum UpstreamError {
    /// Request or read deadline exceeded
    Timeout,
    /// Connect/TLS/transport failure
    Transport(String),
    /// Malformed response or stream payload
    Protocol(String),
    /// 401/403 from the provider
    Auth,
    /// 429 after the retry budget
    RateLimited { retry_after: Option<u64> },
    /// Any other non-success status
    Status { status: u16, body: String },
}

impl UpstreamError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "upstream request timed out"),
            UpstreamError::Transport(msg) => write!(f, "upstream transport error: {msg}"),
            UpstreamError::Protocol(msg) => write!(f, "upstream protocol error: {msg}"),
            UpstreamError::Auth => write!(f, "upstream rejected provider credentials"),
            UpstreamError::RateLimited { .. } => write!(f, "upstream rate limited"),
            UpstreamError::Status { status, body } => {
                write!(f, "upstream returned status {status}: {body}")
            }
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Buffered or streaming native-Anthropic passthrough result
pub enum Passthrough {
    Buffered { status: u16, body: Bytes },
    Stream(SseEventStream),
}

/// Shared HTTP client for all upstream calls
pub struct UpstreamClient {
    http: reqwest::Client,
    timeout: Duration,
    retries: u32,
}

impl UpstreamClient {
    pub fn new(timeout_secs: u64, retries: u32) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // Total deadline is applied per buffered request; streams are
            // bounded by the idle read timeout instead
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            timeout,
            retries,
        })
    }

    /// Buffered OpenAI-compatible call
    pub async fn chat_completion(
        &self,
        provider: &ProviderConfig,
        req: &OpenAiChatRequest,
    ) -> Result<OpenAiChatCompletion, UpstreamError> {
        let url = openai_url(provider);
        let body = serde_json::to_vec(req)
            .map_err(|e| UpstreamError::Protocol(format!("request serialization: {e}")))?;

        let response = self
            .send_with_retry(|| {
                let mut builder = self
                    .http
                    .post(&url)
                    .timeout(self.timeout)
                    .header("content-type", "application/json")
                    .body(body.clone());
                if let Some(key) = provider.resolve_key() {
                    builder = builder.bearer_auth(key);
                }
                builder
            })
            .await?;

        response
            .json::<OpenAiChatCompletion>()
            .await
            .map_err(|e| UpstreamError::Protocol(format!("malformed completion: {e}")))
    }

    /// Streaming OpenAI-compatible call; retries only apply before the
    /// connection is established
    pub async fn chat_completion_stream(
        &self,
        provider: &ProviderConfig,
        req: &OpenAiChatRequest,
    ) -> Result<SseChunkStream, UpstreamError> {
        let url = openai_url(provider);
        let body = serde_json::to_vec(req)
            .map_err(|e| UpstreamError::Protocol(format!("request serialization: {e}")))?;

        let response = self
            .send_with_retry(|| {
                let mut builder = self
                    .http
                    .post(&url)
                    .header("content-type", "application/json")
                    .header("accept", "text/event-stream")
                    .body(body.clone());
                if let Some(key) = provider.resolve_key() {
                    builder = builder.bearer_auth(key);
                }
                builder
            })
            .await?;

        Ok(SseChunkStream::new(response.bytes_stream().boxed()))
    }

    /// Native Anthropic passthrough: original body, rewritten endpoint/auth
    pub async fn anthropic_passthrough(
        &self,
        provider: &ProviderConfig,
        body: &[u8],
        streaming: bool,
    ) -> Result<Passthrough, UpstreamError> {
        let url = anthropic_url(provider);
        let owned_body = body.to_vec();

        let response = self
            .send_with_retry(|| {
                let mut builder = self
                    .http
                    .post(&url)
                    .header("content-type", "application/json")
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .body(owned_body.clone());
                if !streaming {
                    builder = builder.timeout(self.timeout);
                }
                if let Some(key) = provider.resolve_key() {
                    builder = builder.header("x-api-key", key);
                }
                builder
            })
            .await?;

        if streaming {
            Ok(Passthrough::Stream(SseEventStream::new(
                response.bytes_stream().boxed(),
            )))
        } else {
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(UpstreamError::from_reqwest)?;
            Ok(Passthrough::Buffered { status, body })
        }
    }

    /// Send with the retry policy applied; returns the first success
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut attempt: u32 = 0;
        let mut honored_retry_after = false;

        loop {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let code = status.as_u16();
                    let retryable = matches!(code, 408 | 425 | 429);
                    if retryable && attempt < self.retries {
                        let delay = if code == 429 && !honored_retry_after {
                            honored_retry_after = true;
                            retry_after(&response)
                                .unwrap_or_else(|| backoff(attempt))
                        } else {
                            backoff(attempt)
                        };
                        tracing::info!(
                            status = code,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying upstream request"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(Self::classify_status(response).await);
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    if retryable && attempt < self.retries {
                        let delay = backoff(attempt);
                        tracing::info!(
                            error = %e,
                            attempt = attempt + 1,
                            "Retrying upstream request after transport error"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(UpstreamError::from_reqwest(e));
                }
            }
        }
    }

    async fn classify_status(response: reqwest::Response) -> UpstreamError {
        let status = response.status().as_u16();
        match status {
            401 | 403 => UpstreamError::Auth,
            429 => {
                let retry_after = retry_after(&response).map(|d| d.as_secs());
                UpstreamError::RateLimited { retry_after }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                let mut preview: String = body.chars().take(500).collect();
                if preview.len() < body.len() {
                    preview.push('…');
                }
                UpstreamError::Status {
                    status,
                    body: preview,
                }
            }
        }
    }
}

fn openai_url(provider: &ProviderConfig) -> String {
    format!("{}/chat/completions", provider.base_url.trim_end_matches('/'))
}

fn anthropic_url(provider: &ProviderConfig) -> String {
    format!("{}/v1/messages", provider.base_url.trim_end_matches('/'))
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * (attempt as u64 + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderType;

    fn provider(base_url: &str) -> ProviderConfig {
        ProviderConfig {
            name: "Test".to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            env_key: None,
            provider_type: ProviderType::Openai,
            big_models: vec![],
            middle_models: vec![],
            small_models: vec![],
        }
    }

    #[test]
    fn test_openai_url_trims_trailing_slash() {
        assert_eq!(
            openai_url(&provider("https://api.openai.com/v1/")),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            openai_url(&provider("https://api.deepseek.com/v1")),
            "https://api.deepseek.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_anthropic_url() {
        assert_eq!(
            anthropic_url(&provider("https://api.anthropic.com")),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        assert!(backoff(0) < backoff(1));
        assert!(backoff(1) < backoff(2));
    }
}
