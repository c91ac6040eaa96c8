use async_trait::async_trait;
use reqwest::{Client, header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE}};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::models::ids::ProviderId;
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, StreamChunk,
    TokenUsage,
};
use crate::models::sse::{byte_stream, SseChatStream, SseEvent, StreamEvent};

const PROVIDER: ProviderId = ProviderId::OpenAI;

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, PROVIDER.default_endpoint().to_string(), Duration::from_secs(60))
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

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| Error::validation(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OpenAIMessage> {
        messages.iter().map(|msg| OpenAIMessage {
            role: match msg.role {
                MessageRole::User => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
                MessageRole::System => "system".to_string(),
            },
            content: msg.content.clone(),
        }).collect()
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: request.model.wire_name().to_string(),
            messages: self.convert_messages(&request.messages),
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            stream: Some(stream),
        }
    }

    async fn post(&self, body: &OpenAIRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let headers = self.create_headers()?;

        let response = self.client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: {} - {}", status, error_text);
            return Err(Error::provider_call(PROVIDER.to_string(), format!("API error {}: {}", status, error_text)));
        }

        Ok(response)
    }
}

/// Decode a non-streaming chat completion body.
fn parse_response(body: &str) -> Result<ChatResponse> {
    let response: OpenAIResponse = serde_json::from_str(body)
        .map_err(|e| Error::malformed(PROVIDER.to_string(), format!("Failed to parse response: {}", e)))?;

    let choice = response.choices.into_iter().next()
        .ok_or_else(|| Error::malformed(PROVIDER.to_string(), "No choices in response"))?;

    let content = choice.message.content
        .filter(|text| !text.is_empty())
        .ok_or_else(|| Error::malformed(PROVIDER.to_string(), "Choice has no text content"))?;

    let usage = response.usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens),
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        reported_model: response.model,
        usage,
        finish_reason: choice.finish_reason,
    })
}

fn parse_stream_event(event: &SseEvent) -> Result<StreamEvent> {
    if event.data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }

    let chunk: OpenAIStreamResponse = serde_json::from_str(&event.data)
        .map_err(|e| Error::malformed(PROVIDER.to_string(), format!("Failed to parse stream chunk: {}", e)))?;

    match chunk.choices.into_iter().next() {
        Some(choice) => {
            let delta = choice.delta.content.unwrap_or_default();
            if delta.is_empty() && choice.finish_reason.is_none() {
                return Ok(StreamEvent::Skip);
            }
            Ok(StreamEvent::Delta(StreamChunk {
                delta,
                finish_reason: choice.finish_reason,
            }))
        }
        None => Ok(StreamEvent::Skip),
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn send_message(&self, request: &ChatRequest) -> Result<ChatResponse> {
        debug!("Sending request to OpenAI: model={}, messages={}",
               request.model, request.messages.len());

        let start_time = Instant::now();
        let response = self.post(&self.build_request(request, false)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider_call(PROVIDER.to_string(), format!("Failed to read response: {}", e)))?;
        debug!("OpenAI request completed in {:?}", start_time.elapsed());

        parse_response(&body)
    }

    async fn stream_message(&self, request: &ChatRequest) -> Result<Box<dyn ChatStream>> {
        debug!("Starting streaming request to OpenAI: model={}, messages={}",
               request.model, request.messages.len());

        let response = self.post(&self.build_request(request, true)).await?;
        Ok(Box::new(SseChatStream::new(byte_stream(response, PROVIDER), PROVIDER, parse_stream_event)))
    }

    fn provider_id(&self) -> ProviderId {
        PROVIDER
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

// Streaming response structures
#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}
