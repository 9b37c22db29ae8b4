use crate::error::{Error, ErrorDetails};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Keyed monotonic counters. `increment` must be atomic per key with respect
/// to concurrent callers and return the post-increment value.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<u64, Error>;
    async fn increment(&self, key: &str) -> Result<u64, Error>;
}

/// Process-local counter store. Atomicity per key comes from the DashMap
/// entry lock; unrelated keys never contend on a shared lock.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, u64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn fetch(&self, key: &str) -> Result<u64, Error> {
        Ok(self.counters.get(key).map(|v| *v).unwrap_or(0))
    }

    async fn increment(&self, key: &str) -> Result<u64, Error> {
        let value = *self
            .counters
            .entry(key.to_string())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        Ok(value)
    }
}

/// Redis-backed counter store. Every operation is bounded by a timeout and
/// maps failure into a transient ledger error so callers fail closed.
pub struct RedisCounterStore {
    connection: redis::aio::MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisCounterStore {
    pub async fn new(redis_url: &str, op_timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            Error::new(ErrorDetails::Ledger {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Ledger {
                    message: format!("Failed to connect to Redis: {e}"),
                })
            })?;
        Ok(Self {
            connection,
            op_timeout,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn fetch(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.connection.clone();
        let result = timeout(self.op_timeout, conn.get::<_, Option<u64>>(key)).await;
        match result {
            Ok(Ok(value)) => Ok(value.unwrap_or(0)),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::Ledger {
                message: format!("Redis GET {key} failed: {e}"),
            })),
            Err(_) => Err(Error::new(ErrorDetails::Ledger {
                message: format!("Redis GET {key} timed out"),
            })),
        }
    }

    async fn increment(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.connection.clone();
        let result = timeout(self.op_timeout, conn.incr::<_, _, u64>(key, 1u64)).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::Ledger {
                message: format!("Redis INCR {key} failed: {e}"),
            })),
            Err(_) => Err(Error::new(ErrorDetails::Ledger {
                message: format!("Redis INCR {key} timed out"),
            })),
        }
    }
}

/// Usage accounting over calendar-keyed counters. Daily and monthly windows
/// roll over implicitly because the date is part of the key; there is no
/// reset operation.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
}

fn daily_key(date: NaiveDate, user: &str) -> String {
    format!("usage:daily:{}:{user}", date.format("%Y-%m-%d"))
}

fn monthly_key(date: NaiveDate) -> String {
    format!("usage:monthly:{}", date.format("%Y-%m"))
}

fn total_key(user: &str) -> String {
    format!("usage:total:{user}")
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Images `user` has generated during the current UTC calendar day.
    pub async fn daily_count(&self, user: &str) -> Result<u64, Error> {
        self.store
            .fetch(&daily_key(Utc::now().date_naive(), user))
            .await
    }

    pub async fn increment_daily(&self, user: &str) -> Result<u64, Error> {
        let count = self
            .store
            .increment(&daily_key(Utc::now().date_naive(), user))
            .await?;
        debug!(user, count, "daily usage incremented");
        Ok(count)
    }

    /// Images generated by all users during the current UTC calendar month.
    pub async fn global_count(&self) -> Result<u64, Error> {
        self.store
            .fetch(&monthly_key(Utc::now().date_naive()))
            .await
    }

    pub async fn increment_global(&self) -> Result<u64, Error> {
        let count = self
            .store
            .increment(&monthly_key(Utc::now().date_naive()))
            .await?;
        debug!(count, "global monthly usage incremented");
        Ok(count)
    }

    /// Lifetime total for `user`; never rolls over.
    pub async fn total_count(&self, user: &str) -> Result<u64, Error> {
        self.store.fetch(&total_key(user)).await
    }

    pub async fn increment_total(&self, user: &str) -> Result<u64, Error> {
        self.store.increment(&total_key(user)).await
    }
}
