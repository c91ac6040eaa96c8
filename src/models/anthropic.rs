use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::ids::ProviderId;
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, StreamChunk,
    TokenUsage,
};
use crate::models::sse::{byte_stream, SseChatStream, SseEvent, StreamEvent};

const PROVIDER: ProviderId = ProviderId::Anthropic;
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, PROVIDER.default_endpoint().to_string(), Duration::from_secs(120))
    }

    pub fn with_base_url(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Anthropic takes system prompts as a separate top-level field.
    fn convert_messages(&self, messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut anthropic_messages = Vec::new();
        let mut system_message = String::new();

        for message in messages {
            match message.role {
                MessageRole::System => {
                    if !system_message.is_empty() {
                        system_message.push('\n');
                    }
                    system_message.push_str(&message.content);
                }
                MessageRole::User => {
                    anthropic_messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: message.content.clone(),
                    });
                }
                MessageRole::Assistant => {
                    anthropic_messages.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: message.content.clone(),
                    });
                }
            }
        }

        // The API rejects an empty message list
        if anthropic_messages.is_empty() && !system_message.is_empty() {
            anthropic_messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: std::mem::take(&mut system_message),
            });
        }

        let system = if system_message.is_empty() { None } else { Some(system_message) };
        (system, anthropic_messages)
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let (system, messages) = self.convert_messages(&request.messages);
        AnthropicRequest {
            model: request.model.wire_name().to_string(),
            max_tokens: request.max_tokens,
            messages,
            system,
            temperature: request.temperature,
            stream,
        }
    }

    async fn post(&self, body: &AnthropicRequest) -> Result<reqwest::Response> {
        debug!("Making Anthropic API request to model: {}", body.model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("Request failed: {}", e)))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            warn!("Anthropic API error: {} - {}", status, error_text);
            Err(Error::provider_call(PROVIDER.to_string(), format!("API error {}: {}", status, error_text)))
        }
    }
}

fn parse_response(body: &str) -> Result<ChatResponse> {
    let response: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| Error::malformed(PROVIDER.to_string(), format!("Failed to parse response: {}", e)))?;

    let text_blocks: Vec<&str> = response.content
        .iter()
        .filter(|block| block.r#type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();

    if text_blocks.is_empty() {
        return Err(Error::malformed(PROVIDER.to_string(), "Response has no text content blocks"));
    }

    let usage = response.usage
        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(ChatResponse {
        content: text_blocks.concat(),
        reported_model: response.model,
        usage,
        finish_reason: response.stop_reason,
    })
}

fn parse_stream_event(event: &SseEvent) -> Result<StreamEvent> {
    let payload: AnthropicStreamEvent = serde_json::from_str(&event.data)
        .map_err(|e| Error::malformed(PROVIDER.to_string(), format!("Failed to parse stream event: {}", e)))?;

    match payload.r#type.as_str() {
        "content_block_delta" => {
            let text = payload.delta.and_then(|d| d.text).unwrap_or_default();
            if text.is_empty() {
                Ok(StreamEvent::Skip)
            } else {
                Ok(StreamEvent::Delta(StreamChunk::text(text)))
            }
        }
        "message_delta" => match payload.delta.and_then(|d| d.stop_reason) {
            Some(reason) => Ok(StreamEvent::Delta(StreamChunk {
                delta: String::new(),
                finish_reason: Some(reason),
            })),
            None => Ok(StreamEvent::Skip),
        },
        "message_stop" => Ok(StreamEvent::Done),
        "error" => {
            let message = payload.error
                .map(|e| format!("{}: {}", e.r#type, e.message))
                .unwrap_or_else(|| "Unknown stream error".to_string());
            Err(Error::provider_call(PROVIDER.to_string(), message))
        }
        _ => Ok(StreamEvent::Skip),
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn send_message(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let start_time = Instant::now();

        let response = self.post(&self.build_request(request, false)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("Failed to read response: {}", e)))?;

        debug!("Received response from Anthropic API in {:?}", start_time.elapsed());
        parse_response(&body)
    }

    async fn stream_message(&self, request: &ChatRequest) -> Result<Box<dyn ChatStream>> {
        let response = self.post(&self.build_request(request, true)).await?;
        Ok(Box::new(SseChatStream::new(byte_stream(response, PROVIDER), PROVIDER, parse_stream_event)))
    }

    fn provider_id(&self) -> ProviderId {
        PROVIDER
    }
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    r#type: String,
    #[serde(default)]
    delta: Option<AnthropicStreamDelta>,
    #[serde(default)]
    error: Option<AnthropicStreamError>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamError {
    r#type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ids::ModelId;
    use crate::models::sse::bytes_from;

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new("test-key".to_string());
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().provider_id(), ProviderId::Anthropic);
    }

    #[test]
    fn test_system_message_is_lifted() {
        let provider = AnthropicProvider::new("test-key".to_string()).unwrap();

        let messages = vec![
            Message::system("You are a helpful assistant."),
            Message::user("Hello!"),
        ];

        let (system, converted) = provider.convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are a helpful assistant."));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
        assert_eq!(converted[0].content, "Hello!");
    }

    #[test]
    fn test_request_body() {
        let provider = AnthropicProvider::new("test-key".to_string()).unwrap();
        let request = ChatRequest::new(ModelId::Claude35Sonnet, vec![Message::user("hi")]);

        let body = serde_json::to_value(provider.build_request(&request, true)).unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(body["stream"], true);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_response_concatenates_text_blocks() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "text", "text": "Here is "},
                {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                {"type": "text", "text": "the code."}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }"#;

        let response = parse_response(body).unwrap();
        assert_eq!(response.content, "Here is the code.");
        assert_eq!(response.usage.total_tokens, 14);
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_parse_response_without_text_is_malformed() {
        let body = r#"{"content": [], "usage": {"input_tokens": 1, "output_tokens": 0}}"#;
        assert!(matches!(parse_response(body), Err(Error::MalformedUpstreamResponse { .. })));
    }

    #[tokio::test]
    async fn test_stream_events() {
        let bytes = bytes_from(vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]);
        let mut stream = SseChatStream::new(bytes, PROVIDER, parse_stream_event);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().delta, "Hi");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap().delta, " there");
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_error_event() {
        let bytes = bytes_from(vec![
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        ]);
        let mut stream = SseChatStream::new(bytes, PROVIDER, parse_stream_event);

        let err = stream.next_chunk().await.unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }

    #[tokio::test]
    async fn test_stream_without_message_stop_is_truncated() {
        let bytes = bytes_from(vec![
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        ]);
        let mut stream = SseChatStream::new(bytes, PROVIDER, parse_stream_event);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().delta, "Hi");
        assert!(matches!(
            stream.next_chunk().await,
            Err(Error::ProviderCallFailed { .. })
        ));
    }
}
