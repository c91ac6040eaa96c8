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

const PROVIDER: ProviderId = ProviderId::Gemini;

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
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

    fn convert_messages(&self, messages: &[Message]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut gemini_contents = Vec::new();
        let mut system_parts = Vec::new();

        for message in messages {
            match message.role {
                MessageRole::System => {
                    system_parts.push(GeminiPart {
                        text: Some(message.content.clone()),
                    });
                }
                MessageRole::User => {
                    gemini_contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart {
                            text: Some(message.content.clone()),
                        }],
                    });
                }
                MessageRole::Assistant => {
                    gemini_contents.push(GeminiContent {
                        // Gemini calls the assistant "model"
                        role: Some("model".to_string()),
                        parts: vec![GeminiPart {
                            text: Some(message.content.clone()),
                        }],
                    });
                }
            }
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: system_parts,
            })
        };

        (system_instruction, gemini_contents)
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        let (system_instruction, contents) = self.convert_messages(&request.messages);
        GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }

    async fn post(&self, request: &ChatRequest, method: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.base_url,
            request.model.wire_name(),
            method
        );

        let response = self.client
            .post(&url)
            .query(query)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("Request failed: {}", e.without_url())))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            warn!("Gemini API error: {} - {}", status, error_text);
            Err(Error::provider_call(PROVIDER.to_string(), format!("API error {}: {}", status, error_text)))
        }
    }
}

/// Joined text of a candidate's parts; `None` when no part carries text.
fn candidate_text(candidate: &GeminiCandidate) -> Option<String> {
    let content = candidate.content.as_ref()?;
    let text: String = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    (!text.is_empty()).then_some(text)
}

fn parse_response(body: &str) -> Result<ChatResponse> {
    let response: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| Error::malformed(PROVIDER.to_string(), format!("Failed to parse response: {}", e)))?;

    let candidate = response.candidates.first()
        .ok_or_else(|| Error::malformed(PROVIDER.to_string(), "No candidates in response"))?;

    let content = candidate_text(candidate)
        .ok_or_else(|| Error::malformed(PROVIDER.to_string(), "Candidate has no content"))?;

    let usage = response.usage_metadata
        .map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count.unwrap_or(u.prompt_token_count + u.candidates_token_count),
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        reported_model: response.model_version,
        usage,
        finish_reason: candidate.finish_reason.clone(),
    })
}

fn parse_stream_event(event: &SseEvent) -> Result<StreamEvent> {
    let response: GeminiResponse = serde_json::from_str(&event.data)
        .map_err(|e| Error::malformed(PROVIDER.to_string(), format!("Failed to parse stream chunk: {}", e)))?;

    let Some(candidate) = response.candidates.first() else {
        return Ok(StreamEvent::Skip);
    };

    let delta = candidate_text(candidate).unwrap_or_default();
    if delta.is_empty() && candidate.finish_reason.is_none() {
        return Ok(StreamEvent::Skip);
    }

    // Gemini has no end marker; the chunk with a finish reason is the last one.
    let chunk = StreamChunk {
        delta,
        finish_reason: candidate.finish_reason.clone(),
    };
    if chunk.finish_reason.is_some() {
        Ok(StreamEvent::Final(chunk))
    } else {
        Ok(StreamEvent::Delta(chunk))
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn send_message(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let start_time = Instant::now();

        let response = self.post(request, "generateContent", &[]).await?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("Failed to read response: {}", e.without_url())))?;

        debug!("Received response from Gemini API in {:?}", start_time.elapsed());
        parse_response(&body)
    }

    async fn stream_message(&self, request: &ChatRequest) -> Result<Box<dyn ChatStream>> {
        let response = self.post(request, "streamGenerateContent", &[("alt", "sse")]).await?;
        Ok(Box::new(SseChatStream::new(byte_stream(response, PROVIDER), PROVIDER, parse_stream_event)))
    }

    fn provider_id(&self) -> ProviderId {
        PROVIDER
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ids::ModelId;
    use crate::models::sse::bytes_from;

    #[test]
    fn test_provider_creation() {
        let provider = GeminiProvider::new("test-key".to_string());
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().provider_id(), ProviderId::Gemini);
    }

    #[test]
    fn test_message_conversion() {
        let provider = GeminiProvider::new("test-key".to_string()).unwrap();

        let messages = vec![
            Message::system("You are a helpful assistant."),
            Message::user("Hello!"),
            Message::assistant("Hi there!"),
        ];

        let (system, converted) = provider.convert_messages(&messages);
        assert_eq!(system.unwrap().parts[0].text.as_deref(), Some("You are a helpful assistant."));
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role.as_deref(), Some("user"));
        assert_eq!(converted[1].role.as_deref(), Some("model"));
        assert_eq!(converted[1].parts[0].text.as_deref(), Some("Hi there!"));
    }

    #[test]
    fn test_request_body_is_camel_case() {
        let provider = GeminiProvider::new("test-key".to_string()).unwrap();
        let request = ChatRequest::new(ModelId::Gemini15Flash, vec![Message::user("hi")])
            .with_max_tokens(512);

        let body = serde_json::to_value(provider.build_request(&request)).unwrap();
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "const x = 1;"}, {"text": "\n"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 6, "totalTokenCount": 14},
            "modelVersion": "gemini-1.5-flash-002"
        }"#;

        let response = parse_response(body).unwrap();
        assert_eq!(response.content, "const x = 1;\n");
        assert_eq!(response.usage.total_tokens, 14);
        assert_eq!(response.reported_model.as_deref(), Some("gemini-1.5-flash-002"));
    }

    #[test]
    fn test_blocked_candidate_is_malformed() {
        let body = r#"{"candidates": [{"finishReason": "SAFETY"}]}"#;
        assert!(matches!(parse_response(body), Err(Error::MalformedUpstreamResponse { .. })));
    }

    #[tokio::test]
    async fn test_stream_ends_on_finish_reason() {
        let bytes = bytes_from(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"one \"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"two\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        ]);
        let mut stream = SseChatStream::new(bytes, PROVIDER, parse_stream_event);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().delta, "one ");
        let last = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(last.delta, "two");
        assert_eq!(last.finish_reason.as_deref(), Some("STOP"));
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[test]
    fn test_candidate_without_text_is_malformed() {
        let body = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"lookup","args":{}}}]},"finishReason":"STOP"}]}"#;
        assert!(matches!(parse_response(body), Err(Error::MalformedUpstreamResponse { .. })));

        let body = r#"{"candidates":[{"content":{"role":"model","parts":[]},"finishReason":"STOP"}]}"#;
        assert!(matches!(parse_response(body), Err(Error::MalformedUpstreamResponse { .. })));
    }

    #[tokio::test]
    async fn test_stream_without_finish_reason_is_truncated() {
        let bytes = bytes_from(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"one \"}]}}]}\r\n\r\n",
        ]);
        let mut stream = SseChatStream::new(bytes, PROVIDER, parse_stream_event);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().delta, "one ");
        assert!(matches!(
            stream.next_chunk().await,
            Err(Error::ProviderCallFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_api_key_stays_out_of_errors() {
        let provider = GeminiProvider::with_base_url(
            "SECRET-GEMINI-KEY".to_string(),
            "http://127.0.0.1:9".to_string(),
            Duration::from_secs(2),
        )
        .unwrap();
        let request = ChatRequest::new(ModelId::Gemini15Flash, vec![Message::user("hi")]);

        let err = provider.send_message(&request).await.unwrap_err();
        assert!(!err.to_string().contains("SECRET-GEMINI-KEY"));
        assert!(!format!("{:?}", err).contains("SECRET-GEMINI-KEY"));

        let err = provider.stream_message(&request).await.err().unwrap();
        assert!(!err.to_string().contains("SECRET-GEMINI-KEY"));
    }
}
