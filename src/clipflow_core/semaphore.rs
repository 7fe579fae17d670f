//! Named counting semaphore with crash-safe lease expiry.
//!
//! The shared backend is a Redis sorted set per semaphore name mapping
//! token → expiry instant. Every acquire evicts expired tokens first, so a
//! crashed holder frees its slot once the TTL lapses. Release is
//! best-effort; the TTL is the safety net.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SemaphoreError;

/// Backoff between admission attempts grows by ×1.5 up to this cap.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Semaphore: Send + Sync {
    /// Acquire a slot for `name`, bounded by `limit` live holders.
    ///
    /// Returns an opaque token to pass to [`release`](Semaphore::release).
    /// At any wall-clock instant the number of live (unreleased, unexpired)
    /// tokens for a name never exceeds `limit`.
    async fn acquire(
        &self,
        name: &str,
        limit: u32,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<String, SemaphoreError>;

    /// Idempotent release. Unknown or expired tokens are a logged no-op.
    async fn release(&self, name: &str, token: &str);
}

fn sem_key(name: &str) -> String {
    format!("sem:{name}")
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Redis-backed implementation shared across all worker processes.
#[derive(Clone)]
pub struct RedisSemaphore {
    conn: ConnectionManager,
    /// First-attempt backoff; production uses one second.
    initial_backoff: Duration,
}

impl RedisSemaphore {
    pub async fn connect(redis_url: &str) -> Result<Self, SemaphoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| SemaphoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SemaphoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            initial_backoff: Duration::from_secs(1),
        })
    }

    /// One admission attempt: evict expired, check cardinality, insert with
    /// no-overwrite semantics, re-check for the over-admission race.
    async fn try_acquire_once(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
        token: &str,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        let now = unix_now();

        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await?;
        let current: u32 = conn.zcard(key).await?;
        if current >= limit {
            return Ok(false);
        }

        let expiry = now + ttl.as_secs_f64();
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(expiry)
            .arg(token)
            .query_async(&mut conn)
            .await?;
        if added == 0 {
            return Ok(false);
        }

        let recheck: u32 = conn.zcard(key).await?;
        if recheck > limit {
            // Lost the race: another acquirer slipped in between the
            // cardinality read and our insert. Back out and retry.
            let _: i64 = conn.zrem(key, token).await?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl Semaphore for RedisSemaphore {
    async fn acquire(
        &self,
        name: &str,
        limit: u32,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<String, SemaphoreError> {
        let key = sem_key(name);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait_timeout;
        let mut backoff = self.initial_backoff;

        loop {
            let admitted = self
                .try_acquire_once(&key, limit, ttl, &token)
                .await
                .map_err(|e| SemaphoreError::Unavailable(e.to_string()))?;
            if admitted {
                info!(semaphore = name, token = %&token[..8], limit, "acquired slot");
                return Ok(token);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SemaphoreError::Timeout {
                    name: name.to_string(),
                    limit,
                    waited_secs: wait_timeout.as_secs(),
                });
            }

            let wait = backoff.min(remaining);
            debug!(semaphore = name, wait_ms = wait.as_millis() as u64, "slot busy, backing off");
            tokio::time::sleep(wait).await;
            backoff = backoff.mul_f64(1.5).min(BACKOFF_CAP);
        }
    }

    async fn release(&self, name: &str, token: &str) {
        let key = sem_key(name);
        let mut conn = self.conn.clone();
        match conn.zrem::<_, _, i64>(&key, token).await {
            Ok(removed) if removed > 0 => {
                info!(semaphore = name, token = %&token[..8.min(token.len())], "released slot");
            }
            Ok(_) => {
                warn!(
                    semaphore = name,
                    token = %&token[..8.min(token.len())],
                    "release: token not found (already expired or released)"
                );
            }
            Err(e) => {
                // Best-effort: the TTL will reclaim the slot.
                warn!(semaphore = name, error = %e, "release failed");
            }
        }
    }
}

/// Process-local implementation with the same admission contract, used by
/// tests and single-process deployments.
#[derive(Default)]
pub struct MemorySemaphore {
    slots: Mutex<HashMap<String, Vec<(String, Instant)>>>,
}

impl MemorySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) token count for a name; test probe.
    pub fn live_tokens(&self, name: &str) -> usize {
        let now = Instant::now();
        let slots = self.slots.lock().expect("semaphore slots poisoned");
        slots
            .get(name)
            .map(|tokens| tokens.iter().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    fn try_acquire_once(&self, name: &str, limit: u32, ttl: Duration) -> Option<String> {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("semaphore slots poisoned");
        let tokens = slots.entry(name.to_string()).or_default();
        tokens.retain(|(_, expiry)| *expiry > now);
        if tokens.len() >= limit as usize {
            return None;
        }
        let token = Uuid::new_v4().to_string();
        tokens.push((token.clone(), now + ttl));
        Some(token)
    }
}

#[async_trait]
impl Semaphore for MemorySemaphore {
    async fn acquire(
        &self,
        name: &str,
        limit: u32,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<String, SemaphoreError> {
        let deadline = Instant::now() + wait_timeout;
        // In-process polling is cheap; no need for the second-scale backoff
        // the shared store wants.
        let mut backoff = Duration::from_millis(5);
        loop {
            if let Some(token) = self.try_acquire_once(name, limit, ttl) {
                return Ok(token);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SemaphoreError::Timeout {
                    name: name.to_string(),
                    limit,
                    waited_secs: wait_timeout.as_secs(),
                });
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = backoff.mul_f64(1.5).min(Duration::from_millis(200));
        }
    }

    async fn release(&self, name: &str, token: &str) {
        let mut slots = self.slots.lock().expect("semaphore slots poisoned");
        if let Some(tokens) = slots.get_mut(name) {
            let before = tokens.len();
            tokens.retain(|(t, _)| t != token);
            if tokens.len() == before {
                warn!(semaphore = name, "release: token not found");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn memory_semaphore_respects_limit() {
        let sem = MemorySemaphore::new();
        let a = sem
            .acquire("whisper", 2, TTL, Duration::from_millis(50))
            .await
            .unwrap();
        let _b = sem
            .acquire("whisper", 2, TTL, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(sem.live_tokens("whisper"), 2);

        let third = sem.acquire("whisper", 2, TTL, Duration::from_millis(50)).await;
        assert!(matches!(third, Err(SemaphoreError::Timeout { .. })));

        sem.release("whisper", &a).await;
        let c = sem
            .acquire("whisper", 2, TTL, Duration::from_millis(50))
            .await
            .unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn expired_tokens_free_their_slot() {
        let sem = MemorySemaphore::new();
        let _a = sem
            .acquire("ffmpeg", 1, Duration::from_millis(10), Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The first token expired; a new acquire succeeds without release.
        sem.acquire("ffmpeg", 1, TTL, Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_of_unknown_token_is_a_no_op() {
        let sem = MemorySemaphore::new();
        sem.release("whisper", "no-such-token").await;
        assert_eq!(sem.live_tokens("whisper"), 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_over_admit() {
        let sem = Arc::new(MemorySemaphore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let sem = sem.clone();
            handles.push(tokio::spawn(async move {
                sem.acquire("llm", 3, TTL, Duration::from_millis(200)).await
            }));
        }
        // Probe while acquires are racing: the cap must hold throughout.
        for _ in 0..20 {
            assert!(sem.live_tokens("llm") <= 3);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let mut acquired = Vec::new();
        for handle in handles {
            if let Ok(Ok(token)) = handle.await {
                acquired.push(token);
            }
        }
        assert!(sem.live_tokens("llm") <= 3);
        assert_eq!(acquired.len(), 3, "only `limit` waiters fit within the timeout once no one releases");
    }
}
