//! Redis-backed [`Kv`] implementation.
//!
//! A single multiplexed [`ConnectionManager`] is shared across tasks; it
//! reconnects internally, so callers only see transient command errors.
//! Pool limits and retries are the manager's responsibility.

use std::num::NonZeroUsize;
use std::time::Duration;

use redis::{AsyncCommands, Client, aio::ConnectionManager};

use super::Kv;
use crate::{Error, Result};

/// Networked KV store over a Redis-compatible server.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to the store at `url` (`redis://...`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Kv`] if the URL is invalid or the initial
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(Error::from)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

/// TTL as whole seconds, rounded up (the store's expiry granularity).
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            #[allow(clippy::cast_sign_loss)]
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl) as u64).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_if_exists(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("XX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        // SET ... XX replies OK on update, nil when the key was absent.
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.del(keys).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, ttl_secs(ttl)).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.lpush(key, value).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        #[allow(clippy::cast_possible_truncation)]
        let range: Vec<String> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(range)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.rpop(key, None::<NonZeroUsize>).await?)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        #[allow(clippy::cast_possible_truncation)]
        conn.ltrim::<_, ()>(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::Kv(format!("unexpected PING reply: {pong}")))
        }
    }
}
