//! SSE parsing over upstream response byte streams
//!
//! Chunks arrive at arbitrary byte boundaries, so both parsers keep a line
//! buffer and only act on complete frames.

use super::UpstreamError;
use crate::protocol::openai::OpenAiStreamChunk;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// OpenAI-style SSE stream: `data: {json}` lines terminated by `[DONE]`
pub struct SseChunkStream {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
    done: bool,
}

impl SseChunkStream {
    pub fn new(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            bytes,
            buffer: String::new(),
            done: false,
        }
    }

    /// Next parsed chunk; `None` at `[DONE]` or end of stream
    pub async fn next_chunk(&mut self) -> Option<Result<OpenAiStreamChunk, UpstreamError>> {
        loop {
            if self.done {
                return None;
            }

            // Drain complete lines already buffered
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim();

                let Some(data) = line.strip_prefix("data:") else {
                    // event:/comment/empty lines carry no chunk payload
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    self.done = true;
                    return None;
                }
                return Some(
                    serde_json::from_str::<OpenAiStreamChunk>(data).map_err(|e| {
                        UpstreamError::Protocol(format!("malformed stream chunk: {e}"))
                    }),
                );
            }

            match self.bytes.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(UpstreamError::from_reqwest(e)));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Native Anthropic SSE stream, re-chunked at event boundaries (`\n\n`)
/// so downstream hooks see whole events
pub struct SseEventStream {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
    done: bool,
}

impl SseEventStream {
    pub fn new(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            bytes,
            buffer: String::new(),
            done: false,
        }
    }

    /// Next complete SSE frame including its trailing blank line
    pub async fn next_event(&mut self) -> Option<Result<String, UpstreamError>> {
        loop {
            if self.done {
                return None;
            }

            if let Some(pos) = self.buffer.find("\n\n") {
                let frame: String = self.buffer.drain(..pos + 2).collect();
                return Some(Ok(frame));
            }

            match self.bytes.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(UpstreamError::from_reqwest(e)));
                }
                None => {
                    self.done = true;
                    // Trailing partial frame, forwarded as-is
                    if !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        return Some(Ok(rest));
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(parts: Vec<&'static str>) -> BoxStream<'static, reqwest::Result<Bytes>> {
        stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes()))),
        )
        .boxed()
    }

    #[tokio::test]
    async fn test_chunks_split_across_byte_boundaries() {
        let mut sse = SseChunkStream::new(byte_stream(vec![
            "data: {\"id\":\"a\",\"choices\":[{\"index\":0,\"delta\":{\"cont",
            "ent\":\"Hi\"},\"finish_reason\":null}]}\n\ndata: [DONE]\n\n",
        ]));

        let chunk = sse.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
        assert!(sse.next_chunk().await.is_none());
        // Stays exhausted after [DONE]
        assert!(sse.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_event_lines_are_skipped() {
        let mut sse = SseChunkStream::new(byte_stream(vec![
            "event: completion\ndata: {\"id\":\"a\",\"choices\":[]}\n\n",
        ]));
        let chunk = sse.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.id, "a");
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_protocol_error() {
        let mut sse = SseChunkStream::new(byte_stream(vec!["data: {broken\n"]));
        let err = sse.next_chunk().await.unwrap().unwrap_err();
        assert!(matches!(err, UpstreamError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_event_stream_rechunks_at_frame_boundaries() {
        let mut sse = SseEventStream::new(byte_stream(vec![
            "event: message_start\ndata: {}\n\nevent: ping\nda",
            "ta: {}\n\n",
        ]));

        let first = sse.next_event().await.unwrap().unwrap();
        assert_eq!(first, "event: message_start\ndata: {}\n\n");
        let second = sse.next_event().await.unwrap().unwrap();
        assert_eq!(second, "event: ping\ndata: {}\n\n");
        assert!(sse.next_event().await.is_none());
    }
}
