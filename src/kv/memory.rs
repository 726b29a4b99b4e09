//! In-memory [`Kv`] implementation.
//!
//! Backed by a `DashMap` with lazy expiry eviction on access, mirroring the
//! semantics of the networked store closely enough for tests and local
//! development: hard TTL expiry, atomic increments, list operations, and
//! glob pattern scans.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::Kv;
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process KV store for tests and local development.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fetch a live entry, lazily evicting it when expired.
    fn live(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }

    fn with_list<T>(
        &self,
        key: &str,
        create: bool,
        f: impl FnOnce(&mut VecDeque<String>) -> T,
    ) -> Result<Option<T>> {
        // Evict an expired entry before operating on it.
        if self.live(key).is_none() {
            self.entries.remove(key);
            if !create {
                return Ok(None);
            }
        }

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::List(VecDeque::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Stored::List(list) => Ok(Some(f(list))),
            Stored::Str(_) => Err(Error::Kv(format!(
                "WRONGTYPE operation against string key {key}"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            Some(Entry {
                value: Stored::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(Error::Kv(format!(
                "WRONGTYPE operation against list key {key}"
            ))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_if_exists(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        // The shard guard makes the check-and-set atomic.
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.value = Stored::Str(value.to_string());
                entry.expires_at = ttl.map(|d| Instant::now() + d);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        if self.live(key).is_none() {
            self.entries.remove(key);
        }
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Str("0".to_string()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Str(s) => {
                let n: i64 = s
                    .parse()
                    .map_err(|_| Error::Kv(format!("value at {key} is not an integer")))?;
                let n = n + 1;
                *s = n.to_string();
                Ok(n)
            }
            Stored::List(_) => Err(Error::Kv(format!(
                "WRONGTYPE operation against list key {key}"
            ))),
        }
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let n = self.incr(key).await?;
        self.expire(key, ttl).await?;
        Ok(n)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        if self.live(key).is_none() {
            return Ok(false);
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| Error::Kv(format!("invalid scan pattern {pattern}: {e}")))?;
        let mut found: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        found.sort();
        Ok(found)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let len = self.with_list(key, true, |list| {
            list.push_front(value.to_string());
            list.len() as u64
        })?;
        Ok(len.unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let out = self.with_list(key, false, |list| {
            let len = list.len() as i64;
            let norm = |i: i64| -> i64 {
                if i < 0 { (len + i).max(0) } else { i.min(len) }
            };
            let from = norm(start);
            let to = norm(stop).min(len - 1);
            if from > to || len == 0 {
                return Vec::new();
            }
            #[allow(clippy::cast_sign_loss)]
            let (skip, take) = (from as usize, (to - from + 1) as usize);
            list.iter().skip(skip).take(take).cloned().collect()
        })?;
        Ok(out.unwrap_or_default())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let out = self.with_list(key, false, VecDeque::pop_back)?;
        Ok(out.flatten())
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let out = self.with_list(key, false, |list| list.len() as u64)?;
        Ok(out.unwrap_or(0))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.with_list(key, false, |list| {
            let len = list.len() as i64;
            let norm = |i: i64| -> i64 {
                if i < 0 { (len + i).max(0) } else { i.min(len) }
            };
            let from = norm(start);
            let to = norm(stop).min(len - 1);
            #[allow(clippy::cast_sign_loss)]
            let kept: VecDeque<String> = if from > to || len == 0 {
                VecDeque::new()
            } else {
                list.iter()
                    .skip(from as usize)
                    .take((to - from + 1) as usize)
                    .cloned()
                    .collect()
            };
            *list = kept;
        })?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
