//! Exponential backoff for transient provider failures.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{GenerationClient, GenerationRequest, GenerationResponse};
use crate::config::RetryConfig;
use crate::errors::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay before retry number `attempt` (0-based). A provider hint wins
    /// over the computed backoff; both are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        hint.unwrap_or(computed).min(self.max_delay)
    }
}

/// Retries transient errors; everything else is returned immediately.
pub struct RetryingClient {
    inner: Arc<dyn GenerationClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn GenerationClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl GenerationClient for RetryingClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt, err.retry_hint());
                    tracing::warn!(
                        label = %request.label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelTier, ScriptedClient};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(350))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(350));
        assert_eq!(p.delay_for(40, None), Duration::from_millis(350));
    }

    #[test]
    fn test_hint_overrides_but_is_capped() {
        let p = policy();
        assert_eq!(
            p.delay_for(0, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
        assert_eq!(
            p.delay_for(0, Some(Duration::from_secs(10))),
            Duration::from_millis(350)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let scripted = Arc::new(ScriptedClient::queued(vec![
            Err(ProviderError::Transient("502".into())),
            Err(ProviderError::RateLimited { retry_after: None }),
            Ok("ok".into()),
        ]));
        let client = RetryingClient::new(scripted.clone(), policy());
        let req = GenerationRequest::new(ModelTier::Primary, "t", "p");
        let resp = client.generate(&req).await.unwrap();
        assert_eq!(resp.text, "ok");
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_error() {
        let scripted = Arc::new(ScriptedClient::new(|_| {
            Err(ProviderError::Timeout(Duration::from_secs(1)))
        }));
        let client = RetryingClient::new(scripted.clone(), policy());
        let req = GenerationRequest::new(ModelTier::Primary, "t", "p");
        let err = client.generate(&req).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert_eq!(scripted.call_count(), 4);
    }

    #[tokio::test]
    async fn test_non_transient_returns_immediately() {
        let scripted = Arc::new(ScriptedClient::queued(vec![Err(ProviderError::ContextOverflow)]));
        let client = RetryingClient::new(scripted.clone(), policy());
        let req = GenerationRequest::new(ModelTier::Primary, "t", "p");
        assert_eq!(
            client.generate(&req).await.unwrap_err(),
            ProviderError::ContextOverflow
        );
        assert_eq!(scripted.call_count(), 1);
    }
}
