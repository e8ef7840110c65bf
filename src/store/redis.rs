//! Redis Store
//!
//! Registry store backed by Redis hashes and Redis pub/sub. Short-lived
//! commands borrow multiplexed connections from a bounded provider; each
//! subscription holds a dedicated pub/sub connection and one provider permit
//! until its stream is dropped.
//!
//! When `time_between_eviction_runs` is set, the provider runs an eviction
//! pass at most once per interval, piggybacked on `acquire`: it examines the
//! oldest idle connections, drops expired or failing ones, then opens new
//! ones up to `min_idle`.

use crate::config::{PoolConfig, RegistryConfig};
use crate::domain::ports::{MessageStream, RegistryStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

// =============================================================================
// Connection Provider
// =============================================================================

struct IdleConnection {
    conn: MultiplexedConnection,
    since: Instant,
}

/// A borrowed connection and the permit that bounds it
struct Lease {
    conn: MultiplexedConnection,
    _permit: OwnedSemaphorePermit,
}

/// Bounded provider of store connections
struct ConnectionProvider {
    client: redis::Client,
    permits: Arc<Semaphore>,
    /// Oldest first
    idle: Mutex<Vec<IdleConnection>>,
    last_eviction: Mutex<Instant>,
    config: PoolConfig,
}

impl ConnectionProvider {
    fn new(client: redis::Client, config: PoolConfig) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(config.effective_max_total())),
            idle: Mutex::new(Vec::new()),
            last_eviction: Mutex::new(Instant::now()),
            config,
        }
    }

    /// Wait for a free slot, bounded by `max_wait`
    async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match self.config.max_wait {
            Some(max_wait) => tokio::time::timeout(max_wait, acquire)
                .await
                .map_err(|_| Error::Timeout(max_wait))?,
            None => acquire.await,
        };
        permit.map_err(|_| Error::Transport("connection provider closed".to_string()))
    }

    /// Take a reusable idle connection, discarding evictable ones
    fn take_idle(&self) -> Option<MultiplexedConnection> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop() {
            if !is_evictable(candidate.since, self.config.min_evictable_idle) {
                return Some(candidate.conn);
            }
        }
        None
    }

    /// Claim the next eviction run if its interval has elapsed
    fn eviction_due(&self) -> bool {
        let Some(interval) = self.config.time_between_eviction_runs else {
            return false;
        };
        let mut last = self.last_eviction.lock();
        if last.elapsed() < interval {
            return false;
        }
        *last = Instant::now();
        true
    }

    async fn evict(&self) {
        let examined: Vec<IdleConnection> = {
            let mut idle = self.idle.lock();
            let count = self.config.effective_tests_per_eviction_run().min(idle.len());
            idle.drain(..count).collect()
        };

        let mut evicted = 0usize;
        let mut kept = Vec::with_capacity(examined.len());
        for mut candidate in examined {
            if is_evictable(candidate.since, self.config.min_evictable_idle)
                || (self.config.test_while_idle && !ping(&mut candidate.conn).await)
            {
                evicted += 1;
                continue;
            }
            kept.push(candidate);
        }

        let missing = {
            let mut idle = self.idle.lock();
            let room = self.config.effective_max_idle().saturating_sub(idle.len());
            evicted += kept.len().saturating_sub(room);
            kept.truncate(room);
            kept.append(&mut idle);
            *idle = kept;
            self.config.effective_min_idle().saturating_sub(idle.len())
        };

        let mut opened = 0usize;
        for _ in 0..missing {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    self.idle.lock().push(IdleConnection {
                        conn,
                        since: Instant::now(),
                    });
                    opened += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Could not refill idle store connections");
                    break;
                }
            }
        }

        debug!(evicted, opened, idle = self.idle_count(), "Idle connection eviction run");
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    async fn acquire(&self) -> Result<Lease> {
        if self.eviction_due() {
            self.evict().await;
        }
        let permit = self.permit().await?;

        if let Some(mut conn) = self.take_idle() {
            if !self.config.test_on_borrow || ping(&mut conn).await {
                return Ok(Lease {
                    conn,
                    _permit: permit,
                });
            }
            debug!("Discarding idle store connection that failed validation");
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Lease {
            conn,
            _permit: permit,
        })
    }

    async fn release(&self, lease: Lease, healthy: bool) {
        let Lease { mut conn, _permit } = lease;
        if !healthy {
            return;
        }
        if self.config.test_on_return && !ping(&mut conn).await {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.effective_max_idle() {
            idle.push(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }
    }
}

fn is_evictable(since: Instant, min_evictable_idle: Option<Duration>) -> bool {
    min_evictable_idle
        .map(|limit| since.elapsed() >= limit)
        .unwrap_or(false)
}

async fn ping(conn: &mut MultiplexedConnection) -> bool {
    let reply: redis::RedisResult<String> = redis::cmd("PING").query_async(conn).await;
    reply.is_ok()
}

// =============================================================================
// Redis Store
// =============================================================================

/// Redis-backed registry store
pub struct RedisStore {
    client: redis::Client,
    provider: ConnectionProvider,
    server_addr: String,
}

impl RedisStore {
    /// Create a store for the configured server. No connection is opened
    /// until the first command.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url().as_str())?;
        info!(
            server = %config.server_addr(),
            db = config.db,
            max_total = config.pool.effective_max_total(),
            "Redis registry store configured"
        );

        Ok(Self {
            provider: ConnectionProvider::new(client.clone(), config.pool.clone()),
            client,
            server_addr: config.server_addr(),
        })
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut lease = self.provider.acquire().await?;
        let result: redis::RedisResult<()> = lease.conn.hset(key, field, value).await;
        self.provider.release(lease, result.is_ok()).await;
        Ok(result?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut lease = self.provider.acquire().await?;
        let result: redis::RedisResult<i64> = lease.conn.hdel(key, field).await;
        self.provider.release(lease, result.is_ok()).await;
        Ok(result? > 0)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut lease = self.provider.acquire().await?;
        let result: redis::RedisResult<HashMap<String, String>> = lease.conn.hgetall(key).await;
        self.provider.release(lease, result.is_ok()).await;
        Ok(result?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut lease = self.provider.acquire().await?;
        let result: redis::RedisResult<i64> = lease.conn.publish(channel, message).await;
        self.provider.release(lease, result.is_ok()).await;
        Ok(result?.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let permit = self.provider.permit().await?;
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Redis subscription established");

        let channel = channel.to_string();
        let messages = Box::pin(pubsub.into_on_message());
        let stream = futures::stream::unfold(
            (messages, permit, channel),
            |(mut messages, permit, channel)| async move {
                let msg = messages.next().await?;
                let payload = payload_text(&channel, msg.get_payload_bytes());
                Some((payload, (messages, permit, channel)))
            },
        );
        Ok(stream.boxed())
    }

    fn store_name(&self) -> &str {
        "redis"
    }
}

/// Pub/sub payloads are text; anything else is a protocol fault
fn payload_text(channel: &str, payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec()).map_err(|e| {
        warn!(channel = %channel, error = %e, "Non-UTF-8 pub/sub payload");
        Error::protocol(format!("non-UTF-8 payload on {}: {}", channel, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn config(max_total: usize, max_wait_ms: u64) -> RegistryConfig {
        RegistryConfig {
            pool: PoolConfig {
                max_total: Some(max_total),
                max_wait: Some(Duration::from_millis(max_wait_ms)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_store_creation_is_lazy() {
        let store = RedisStore::new(&config(2, 50)).unwrap();
        assert_eq!(store.server_addr(), "127.0.0.1:6379");
        assert_eq!(store.store_name(), "redis");
    }

    #[tokio::test]
    async fn test_permit_wait_is_bounded() {
        let store = RedisStore::new(&config(1, 20)).unwrap();

        let held = store.provider.permit().await.unwrap();
        assert_matches!(store.provider.permit().await, Err(Error::Timeout(_)));

        drop(held);
        assert!(store.provider.permit().await.is_ok());
    }

    #[test]
    fn test_binary_payload_is_protocol_fault() {
        let err = payload_text("registry.redis.c1", &[0x31, 0xff, 0xfe]).unwrap_err();
        assert_matches!(err, Error::Protocol { .. });
        assert!(err.is_fatal());
        assert!(!err.is_transient());

        assert_eq!(
            payload_text("registry.redis.c1", b"10.0.0.1:8091-REGISTER").unwrap(),
            "10.0.0.1:8091-REGISTER"
        );
    }

    #[test]
    fn test_evictable_after_min_idle_time() {
        let since = Instant::now() - Duration::from_millis(50);
        assert!(is_evictable(since, Some(Duration::from_millis(20))));
        assert!(!is_evictable(since, Some(Duration::from_secs(60))));
        assert!(!is_evictable(since, None));
    }

    #[tokio::test]
    async fn test_eviction_runs_once_per_interval() {
        let unset = RedisStore::new(&config(2, 50)).unwrap();
        assert!(!unset.provider.eviction_due());

        let mut spaced = config(2, 50);
        spaced.pool.time_between_eviction_runs = Some(Duration::from_millis(30));
        let store = RedisStore::new(&spaced).unwrap();

        assert!(!store.provider.eviction_due());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.provider.eviction_due());
        assert!(!store.provider.eviction_due());
    }

    #[tokio::test]
    async fn test_eviction_refill_tolerates_unreachable_server() {
        let mut unreachable = config(2, 50);
        unreachable.port = 1;
        unreachable.pool.min_idle = Some(2);
        unreachable.pool.time_between_eviction_runs = Some(Duration::from_millis(1));
        let store = RedisStore::new(&unreachable).unwrap();

        store.provider.evict().await;
        assert_eq!(store.provider.idle_count(), 0);

        // acquire still surfaces the connect failure itself
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = store.provider.acquire().await.err().unwrap();
        assert!(err.is_transient());
    }
}
