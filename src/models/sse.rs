//! Server-sent-events framing shared by every streaming adapter.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::ids::ProviderId;
use crate::models::provider::{ChatStream, StreamChunk};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Adapt a reqwest body into a provider-tagged byte stream.
pub fn byte_stream(response: reqwest::Response, provider: ProviderId) -> ByteStream {
    response
        .bytes_stream()
        .map(move |chunk| {
            chunk.map_err(|e| Error::provider_call(provider.to_string(), format!("Stream read error: {}", e.without_url())))
        })
        .boxed()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

pub struct SseReader {
    bytes: ByteStream,
    buffer: Vec<u8>,
    finished: bool,
    provider: ProviderId,
}

impl SseReader {
    pub fn new(bytes: ByteStream, provider: ProviderId) -> Self {
        Self {
            bytes,
            buffer: Vec::new(),
            finished: false,
            provider,
        }
    }

    async fn read_next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
                return self.decode_line(&line[..line.len() - 1]).map(Some);
            }

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return self.decode_line(&line).map(Some);
            }

            match self.bytes.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.finished = true,
            }
        }
    }

    fn decode_line(&self, raw: &[u8]) -> Result<String> {
        let line = std::str::from_utf8(raw).map_err(|e| {
            Error::malformed(self.provider.to_string(), format!("Invalid UTF-8 in stream: {}", e))
        })?;
        Ok(line.trim_end_matches('\r').to_string())
    }

    /// Next complete event, or `None` when the body ends.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        let mut event_name: Option<String> = None;
        let mut data_lines: Vec<String> = Vec::new();

        loop {
            let line = match self.read_next_line().await? {
                Some(line) => line,
                None => {
                    if data_lines.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(SseEvent {
                        event: event_name,
                        data: data_lines.join("\n"),
                    }));
                }
            };

            if line.is_empty() {
                if data_lines.is_empty() {
                    event_name = None;
                    continue;
                }
                return Ok(Some(SseEvent {
                    event: event_name,
                    data: data_lines.join("\n"),
                }));
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };

            match field {
                "event" => event_name = Some(value.to_string()),
                "data" => data_lines.push(value.to_string()),
                other => debug!("Ignoring SSE field '{}' from {}", other, self.provider),
            }
        }
    }
}

/// What one SSE event means to a particular provider.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(StreamChunk),
    /// Last chunk of the response; the backend sends no separate end marker.
    Final(StreamChunk),
    Skip,
    Done,
}

pub type EventParser = fn(&SseEvent) -> Result<StreamEvent>;

/// `ChatStream` over an SSE body, interpreted by a provider's event parser.
///
/// A body that ends before the parser reports completion is an error.
pub struct SseChatStream {
    reader: SseReader,
    parse: EventParser,
    provider: ProviderId,
    done: bool,
}

impl SseChatStream {
    pub fn new(bytes: ByteStream, provider: ProviderId, parse: EventParser) -> Self {
        Self {
            reader: SseReader::new(bytes, provider),
            parse,
            provider,
            done: false,
        }
    }
}

#[async_trait]
impl ChatStream for SseChatStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        while !self.done {
            let Some(event) = self.reader.next_event().await? else {
                self.done = true;
                debug!("{} stream body ended without a completion signal", self.provider);
                return Err(Error::provider_call(
                    self.provider.to_string(),
                    "Stream ended before completion",
                ));
            };

            match (self.parse)(&event)? {
                StreamEvent::Delta(chunk) => return Ok(Some(chunk)),
                StreamEvent::Final(chunk) => {
                    self.done = true;
                    return Ok(Some(chunk));
                }
                StreamEvent::Skip => continue,
                StreamEvent::Done => self.done = true,
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
pub(crate) fn bytes_from(chunks: Vec<&'static str>) -> ByteStream {
    futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed()
}
