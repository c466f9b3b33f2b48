//! Multi-key pool with proactive sliding-window throttling.
//!
//! Every key keeps a window of recent token usage. A request reserves its
//! estimated cost on the least-loaded key; when even that key would exceed its
//! per-window limit, the caller waits until enough usage ages out instead of
//! provoking a 429.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{GenerationClient, GenerationRequest, GenerationResponse};
use crate::errors::ProviderError;

#[derive(Debug, Clone, Copy)]
struct Usage {
    id: u64,
    at: Instant,
    tokens: u64,
}

/// Usage charged to one key. Reservations that had to wait are dated in the
/// future, so entries are not kept in time order.
#[derive(Debug, Default)]
struct KeyWindow {
    events: Vec<Usage>,
}

impl KeyWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        self.events.retain(|e| e.at + window > now);
    }

    fn used(&self) -> u64 {
        self.events.iter().map(|e| e.tokens).sum()
    }
}

/// A slot handed out by [`KeyPool::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub key: usize,
    pub wait: Duration,
    id: u64,
}

#[derive(Debug)]
pub struct KeyPool {
    keys: Mutex<Vec<KeyWindow>>,
    window: Duration,
    limit: u64,
    next_id: AtomicU64,
}

impl KeyPool {
    pub fn new(keys: usize, window: Duration, tokens_per_window: u64) -> Self {
        Self {
            keys: Mutex::new((0..keys.max(1)).map(|_| KeyWindow::default()).collect()),
            window,
            limit: tokens_per_window.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    fn charge(&self, key: &mut KeyWindow, at: Instant, tokens: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        key.events.push(Usage { id, at, tokens });
        id
    }

    pub async fn len(&self) -> usize {
        self.keys.lock().await.len()
    }

    /// Reserve `estimate` tokens on the least-loaded key.
    pub async fn reserve(&self, estimate: u64) -> Reservation {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        for key in keys.iter_mut() {
            key.prune(now, self.window);
        }
        let (index, used) = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (i, k.used()))
            .min_by_key(|(i, used)| (*used, *i))
            .unwrap_or((0, 0));

        let wait = if used + estimate <= self.limit {
            Duration::ZERO
        } else {
            self.wait_until_fits(&keys[index], now, estimate)
        };
        let id = self.charge(&mut keys[index], now + wait, estimate);
        Reservation {
            key: index,
            wait,
            id,
        }
    }

    /// Time until usage expiring in order leaves room for `estimate`.
    fn wait_until_fits(&self, key: &KeyWindow, now: Instant, estimate: u64) -> Duration {
        let mut events = key.events.clone();
        events.sort_by_key(|e| e.at);
        let mut remaining = key.used();
        for event in &events {
            remaining -= event.tokens;
            if remaining + estimate <= self.limit {
                return (event.at + self.window).saturating_duration_since(now);
            }
        }
        events
            .last()
            .map(|e| (e.at + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Replace a reservation's estimate with the actual usage.
    pub async fn settle(&self, reservation: Reservation, actual: u64) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.get_mut(reservation.key)
            && let Some(event) = key.events.iter_mut().find(|e| e.id == reservation.id)
        {
            event.tokens = actual;
        }
    }

    /// Mark a key as exhausted for one full window after a 429.
    pub async fn penalize(&self, key: usize) {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        if let Some(window) = keys.get_mut(key) {
            self.charge(window, now, self.limit);
        }
    }

    pub async fn usage(&self, key: usize) -> u64 {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        match keys.get_mut(key) {
            Some(window) => {
                window.prune(now, self.window);
                window.used()
            }
            None => 0,
        }
    }
}

/// Routes each request to one of several per-key clients through a [`KeyPool`].
pub struct PooledClient {
    pool: KeyPool,
    clients: Vec<Arc<dyn GenerationClient>>,
    chars_per_token: usize,
}

impl PooledClient {
    pub fn new(pool: KeyPool, clients: Vec<Arc<dyn GenerationClient>>) -> Self {
        Self {
            pool,
            clients,
            chars_per_token: 4,
        }
    }
}

#[async_trait]
impl GenerationClient for PooledClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        if self.clients.is_empty() {
            return Err(ProviderError::Fatal("no generation clients configured".into()));
        }
        let estimate = request.estimated_tokens(self.chars_per_token);
        let reservation = self.pool.reserve(estimate).await;
        if !reservation.wait.is_zero() {
            tracing::info!(
                key = reservation.key,
                wait_ms = reservation.wait.as_millis() as u64,
                label = %request.label,
                "key pool saturated, throttling"
            );
            tokio::time::sleep(reservation.wait).await;
        }
        let client = &self.clients[reservation.key % self.clients.len()];
        match client.generate(request).await {
            Ok(response) => {
                self.pool
                    .settle(reservation, response.usage.total().max(1))
                    .await;
                Ok(response)
            }
            Err(err) => {
                self.pool.settle(reservation, 0).await;
                if matches!(err, ProviderError::RateLimited { .. }) {
                    self.pool.penalize(reservation.key).await;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelTier, ScriptedClient};

    #[tokio::test(start_paused = true)]
    async fn test_reservations_spread_across_keys() {
        let pool = KeyPool::new(2, Duration::from_secs(60), 1000);
        let a = pool.reserve(400).await;
        let b = pool.reserve(400).await;
        assert_ne!(a.key, b.key);
        assert!(a.wait.is_zero() && b.wait.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_waits_for_window() {
        let pool = KeyPool::new(1, Duration::from_secs(60), 1000);
        let first = pool.reserve(800).await;
        assert!(first.wait.is_zero());
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = pool.reserve(500).await;
        assert_eq!(second.wait, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_ages_out_and_settles() {
        let pool = KeyPool::new(1, Duration::from_secs(60), 1000);
        let r = pool.reserve(900).await;
        pool.settle(r, 100).await;
        assert_eq!(pool.usage(0).await, 100);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.usage(0).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_targets_its_own_reservation() {
        let pool = KeyPool::new(1, Duration::from_secs(60), 1000);
        let a = pool.reserve(300).await;
        let b = pool.reserve(300).await;
        pool.settle(b, 50).await;
        pool.settle(a, 100).await;
        assert_eq!(pool.usage(0).await, 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_usage_behind_a_delayed_reservation_is_pruned() {
        let pool = KeyPool::new(1, Duration::from_secs(60), 1000);
        pool.reserve(800).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        let delayed = pool.reserve(500).await;
        assert_eq!(delayed.wait, Duration::from_secs(50));
        // Charged now, expiring before the delayed reservation does.
        pool.penalize(0).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.usage(0).await, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_penalizes_key() {
        let limited: Arc<dyn GenerationClient> = Arc::new(ScriptedClient::new(|_| {
            Err(ProviderError::RateLimited { retry_after: None })
        }));
        let healthy: Arc<dyn GenerationClient> =
            Arc::new(ScriptedClient::new(|_| Ok("fine".into())));
        let client = PooledClient::new(
            KeyPool::new(2, Duration::from_secs(60), 10_000),
            vec![limited, healthy],
        );
        let req = GenerationRequest::new(ModelTier::Primary, "t", "p").with_max_tokens(10);
        assert!(client.generate(&req).await.is_err());
        // Key 0 is now saturated, so the next request lands on key 1.
        let resp = client.generate(&req).await.unwrap();
        assert_eq!(resp.text, "fine");
    }
}
