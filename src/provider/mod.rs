//! Generation provider abstraction.
//!
//! The orchestrator only ever talks to a [`GenerationClient`]. The production
//! stack is `RetryingClient(PooledClient([ClaudeCliClient; keys]))`, built by
//! [`build_client`]; tests substitute a [`ScriptedClient`].

pub mod claude;
pub mod pool;
pub mod retry;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ProviderConfig, RetryConfig};
use crate::errors::ProviderError;

pub use claude::ClaudeCliClient;
pub use pool::{KeyPool, PooledClient};
pub use retry::{RetryPolicy, RetryingClient};
pub use scripted::ScriptedClient;

/// Which model a request should run on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Generation, planning, second-tier fixes
    Primary,
    /// Audits and first-tier fixes
    Economy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub tier: ModelTier,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    /// Short activity label for logs, e.g. `"generate app/main.py"`
    pub label: String,
}

impl GenerationRequest {
    pub fn new(tier: ModelTier, label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            tier,
            system: String::new(),
            prompt: prompt.into(),
            max_tokens: 4096,
            label: label.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Rough token estimate of the request, prompt plus the full output budget.
    pub fn estimated_tokens(&self, chars_per_token: usize) -> u64 {
        let chars = self.system.len() + self.prompt.len();
        (chars / chars_per_token.max(1)) as u64 + self.max_tokens as u64
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// A text generation backend.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
    -> Result<GenerationResponse, ProviderError>;
}

/// Assemble the production client stack from configuration.
pub fn build_client(provider: &ProviderConfig, retry: &RetryConfig) -> Arc<dyn GenerationClient> {
    let keys: Vec<Option<String>> = if provider.api_keys.is_empty() {
        vec![None]
    } else {
        provider.api_keys.iter().cloned().map(Some).collect()
    };
    let clients: Vec<Arc<dyn GenerationClient>> = keys
        .into_iter()
        .map(|key| Arc::new(ClaudeCliClient::new(provider, key)) as Arc<dyn GenerationClient>)
        .collect();
    let pool = KeyPool::new(
        clients.len(),
        std::time::Duration::from_secs(provider.window_secs),
        provider.tokens_per_window,
    );
    let pooled = Arc::new(PooledClient::new(pool, clients));
    Arc::new(RetryingClient::new(pooled, RetryPolicy::from_config(retry)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_and_estimate() {
        let req = GenerationRequest::new(ModelTier::Economy, "audit x", "a".repeat(400))
            .with_system("b".repeat(100))
            .with_max_tokens(1000);
        assert_eq!(req.tier, ModelTier::Economy);
        assert_eq!(req.estimated_tokens(4), 125 + 1000);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        usage.add(TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
        });
        assert_eq!(usage.total(), 17);
    }
}
