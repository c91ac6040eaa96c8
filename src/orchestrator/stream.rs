use futures_util::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::ids::{ModelId, ProviderId};
use crate::models::provider::ChatStream;

enum State {
    Open(Box<dyn ChatStream>),
    Failed(Error),
    Finished,
}

/// Provider-agnostic sequence of non-empty text fragments.
///
/// Yields fragments in backend order and ends when the backend signals
/// completion. A backend failure is delivered as one final `Err`, after which
/// the stream yields nothing more.
pub struct FragmentStream {
    state: State,
    route: Option<(ProviderId, ModelId)>,
    cancel: Option<CancellationToken>,
    fragments: usize,
}

impl FragmentStream {
    pub fn new(provider: ProviderId, model: ModelId, inner: Box<dyn ChatStream>) -> Self {
        Self {
            state: State::Open(inner),
            route: Some((provider, model)),
            cancel: None,
            fragments: 0,
        }
    }

    /// A stream whose only item is `error`.
    pub fn failed(error: Error) -> Self {
        Self {
            state: State::Failed(error),
            route: None,
            cancel: None,
            fragments: 0,
        }
    }

    /// Stop pulling when `token` fires; the stream then ends with `Cancelled`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn provider(&self) -> Option<ProviderId> {
        self.route.map(|(provider, _)| provider)
    }

    pub fn model(&self) -> Option<ModelId> {
        self.route.map(|(_, model)| model)
    }

    pub async fn next_fragment(&mut self) -> Option<Result<String>> {
        loop {
            let mut inner = match std::mem::replace(&mut self.state, State::Finished) {
                State::Open(inner) => inner,
                State::Failed(error) => return Some(Err(error)),
                State::Finished => return None,
            };

            let pulled = match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!("Stream cancelled after {} fragments", self.fragments);
                            return Some(Err(Error::Cancelled));
                        }
                        pulled = inner.next_chunk() => pulled,
                    }
                }
                None => inner.next_chunk().await,
            };

            match pulled {
                Ok(Some(chunk)) => {
                    self.state = State::Open(inner);
                    if chunk.delta.is_empty() {
                        continue;
                    }
                    self.fragments += 1;
                    return Some(Ok(chunk.delta));
                }
                Ok(None) => {
                    debug!("Stream finished after {} fragments", self.fragments);
                    return None;
                }
                Err(e) => {
                    warn!("Stream failed after {} fragments: {}", self.fragments, e);
                    return Some(Err(e));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String>> + Send {
        stream::unfold(self, |mut fragments| async move {
            fragments.next_fragment().await.map(|item| (item, fragments))
        })
    }

    /// Concatenate every fragment, failing on the first error.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next_fragment().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}
