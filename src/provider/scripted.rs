//! Deterministic generation client for tests and dry runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{GenerationClient, GenerationRequest, GenerationResponse, ModelTier, TokenUsage};
use crate::errors::ProviderError;

type Responder = Box<dyn Fn(&GenerationRequest) -> Result<String, ProviderError> + Send + Sync>;

/// Answers requests from a closure, counting calls and keeping every request.
pub struct ScriptedClient {
    responder: Responder,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies in order; once the queue is empty every call fails.
    pub fn queued(replies: Vec<Result<String, ProviderError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Fatal("script exhausted".into())))
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests whose label starts with `prefix`.
    pub fn calls_labelled(&self, prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.label.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let text = (self.responder)(request)?;
        let model = match request.tier {
            ModelTier::Primary => "scripted-primary",
            ModelTier::Economy => "scripted-economy",
        };
        Ok(GenerationResponse {
            usage: TokenUsage {
                input_tokens: (request.prompt.len() / 4) as u64,
                output_tokens: (text.len() / 4) as u64,
            },
            text,
            model: model.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_replies_then_exhaustion() {
        let client = ScriptedClient::queued(vec![Ok("one".into())]);
        let req = GenerationRequest::new(ModelTier::Economy, "audit a.py", "p");
        let first = client.generate(&req).await.unwrap();
        assert_eq!(first.text, "one");
        assert_eq!(first.model, "scripted-economy");
        assert!(client.generate(&req).await.is_err());
        assert_eq!(client.call_count(), 2);
        assert_eq!(client.calls_labelled("audit"), 2);
    }
}
