//! In-memory providers for exercising the orchestrator without network I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::ids::ProviderId;
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, ModelProvider, StreamChunk, TokenUsage,
};

#[derive(Debug, Clone)]
enum Script {
    Reply(String),
    Fail(String),
    Malformed,
    /// Streams these fragments; `send_message` returns them joined.
    Fragments(Vec<String>),
    FailMidStream { fragments: Vec<String>, message: String },
}

#[derive(Debug)]
pub struct ScriptedProvider {
    id: ProviderId,
    script: Script,
    usage: TokenUsage,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(id: ProviderId, script: Script) -> Self {
        Self {
            id,
            script,
            usage: TokenUsage::new(10, 20),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(id: ProviderId, content: impl Into<String>) -> Self {
        Self::new(id, Script::Reply(content.into()))
    }

    pub fn failing(id: ProviderId, message: impl Into<String>) -> Self {
        Self::new(id, Script::Fail(message.into()))
    }

    pub fn malformed(id: ProviderId) -> Self {
        Self::new(id, Script::Malformed)
    }

    pub fn streaming(id: ProviderId, fragments: &[&str]) -> Self {
        Self::new(id, Script::Fragments(fragments.iter().map(|f| f.to_string()).collect()))
    }

    pub fn failing_mid_stream(id: ProviderId, fragments: &[&str], message: impl Into<String>) -> Self {
        Self::new(
            id,
            Script::FailMidStream {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                message: message.into(),
            },
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Number of `send_message`/`stream_message` calls that reached this provider.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn send_message(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.begin_call().await;

        let content = match &self.script {
            Script::Reply(content) => content.clone(),
            Script::Fragments(fragments) => fragments.concat(),
            Script::Fail(message) | Script::FailMidStream { message, .. } => {
                return Err(Error::provider_call(self.id.to_string(), message.clone()));
            }
            Script::Malformed => {
                return Err(Error::malformed(self.id.to_string(), "no candidates in response"));
            }
        };

        Ok(ChatResponse {
            content,
            reported_model: Some(request.model.wire_name().to_string()),
            usage: self.usage,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn stream_message(&self, _request: &ChatRequest) -> Result<Box<dyn ChatStream>> {
        self.begin_call().await;

        let mut items: VecDeque<Result<StreamChunk>> = VecDeque::new();
        match &self.script {
            Script::Reply(content) => items.push_back(Ok(StreamChunk::text(content.clone()))),
            Script::Fragments(fragments) => {
                items.extend(fragments.iter().map(|f| Ok(StreamChunk::text(f.clone()))));
            }
            Script::FailMidStream { fragments, message } => {
                items.extend(fragments.iter().map(|f| Ok(StreamChunk::text(f.clone()))));
                items.push_back(Err(Error::provider_call(self.id.to_string(), message.clone())));
            }
            Script::Fail(message) => {
                return Err(Error::provider_call(self.id.to_string(), message.clone()));
            }
            Script::Malformed => {
                return Err(Error::malformed(self.id.to_string(), "no candidates in response"));
            }
        }

        Ok(Box::new(ScriptedStream { items }))
    }

    fn provider_id(&self) -> ProviderId {
        self.id
    }
}

struct ScriptedStream {
    items: VecDeque<Result<StreamChunk>>,
}

#[async_trait]
impl ChatStream for ScriptedStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        match self.items.pop_front() {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }
}
