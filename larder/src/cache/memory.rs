//! In-RAM cache backend. Bodies are buffered whole; eviction happens on
//! write, victims chosen by soonest expiry.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{effective_ttl, Cache, Error, Stats, Stream, Writer, DEFAULT_MAX_TTL};
use crate::headers::Headers;
use crate::key::Key;

/// Registry id of this backend.
pub const ID: &str = "memory";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Total size of cached bodies, in MiB.
    #[serde(default = "defaults::limit_mb")]
    pub limit_mb: u64,
    /// Maximum entry lifetime.
    #[serde(with = "crate::serde_ext::duration", default = "defaults::max_ttl")]
    pub max_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limit_mb: defaults::limit_mb(),
            max_ttl: defaults::max_ttl(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn limit_mb() -> u64 {
        256
    }

    pub fn max_ttl() -> Duration {
        super::DEFAULT_MAX_TTL
    }
}

pub(super) async fn factory(config: serde_json::Value) -> Result<Box<dyn Cache>, Error> {
    let config: Config =
        serde_json::from_value(config).map_err(|e| Error::Config(e.to_string()))?;

    Ok(Box::new(MemoryCache::new(config)))
}

struct Entry {
    body: Bytes,
    headers: Headers,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<Key, Entry>,
    /// Total size of all bodies in `entries`.
    size: u64,
}

impl Table {
    fn remove(&mut self, key: &Key) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.body.len() as u64;

        Some(entry)
    }

    /// Free at least `needed` bytes by dropping the entries closest to
    /// expiry.
    fn evict(&mut self, needed: u64) {
        let mut victims: Vec<(Key, DateTime<Utc>, u64)> = self
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.expires_at, entry.body.len() as u64))
            .collect();
        victims.sort_by_key(|(_, expires_at, _)| *expires_at);

        let mut freed = 0;
        for (key, _, len) in victims {
            if freed >= needed {
                break;
            }
            self.remove(&key);
            freed += len;
        }
    }
}

pub struct MemoryCache {
    limit: u64,
    max_ttl: Duration,
    table: Arc<RwLock<Table>>,
}

impl MemoryCache {
    pub fn new(config: Config) -> Self {
        Self {
            limit: config.limit_mb * 1024 * 1024,
            max_ttl: config.max_ttl,
            table: Arc::new(RwLock::new(Table::default())),
        }
    }

    fn lookup(&self, key: &Key) -> Result<(Bytes, Headers), Error> {
        let table = self.table.read().expect("memory cache lock is not poisoned");
        let entry = table.entries.get(key).ok_or(Error::NotFound)?;
        if entry.expires_at <= Utc::now() {
            // Expired entries read as absent; the next write sweeps them.
            return Err(Error::NotFound);
        }
        Ok((entry.body.clone(), entry.headers.clone()))
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn stat(&self, key: &Key) -> Result<Headers, Error> {
        self.lookup(key).map(|(_, headers)| headers)
    }

    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error> {
        let (body, headers) = self.lookup(key)?;

        Ok((Box::new(Cursor::new(body)) as Stream, headers))
    }

    async fn create(
        &self,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error> {
        headers.ensure_last_modified(Utc::now());

        Ok(Box::new(MemoryWriter {
            key: *key,
            headers,
            ttl: effective_ttl(ttl, self.max_ttl),
            buffer: Vec::new(),
            limit: self.limit,
            table: self.table.clone(),
        }))
    }

    async fn delete(&self, key: &Key) -> Result<(), Error> {
        let mut table = self.table.write().expect("memory cache lock is not poisoned");
        table.remove(key).map(|_| ()).ok_or(Error::NotFound)
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn stats(&self) -> Result<Stats, Error> {
        let table = self.table.read().expect("memory cache lock is not poisoned");

        Ok(Stats {
            objects: table.entries.len() as u64,
            size: table.size,
            capacity: self.limit,
        })
    }
}

struct MemoryWriter {
    key: Key,
    headers: Headers,
    ttl: Duration,
    buffer: Vec<u8>,
    limit: u64,
    table: Arc<RwLock<Table>>,
}

#[async_trait]
impl Writer for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(chunk);

        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let new_size = self.buffer.len() as u64;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).map_err(Error::unavailable)?;

        let mut table = self.table.write().expect("memory cache lock is not poisoned");
        let old_size = table
            .entries
            .get(&self.key)
            .map(|e| e.body.len() as u64)
            .unwrap_or(0);

        if new_size > self.limit {
            // The entry can never fit; dropping it here lets a larger tier
            // behind this one keep the only copy.
            tracing::debug!(key = %self.key, size = new_size, "entry exceeds memory cache limit, skipping");
            table.remove(&self.key);
            return Ok(());
        }
        if table.size - old_size + new_size > self.limit {
            let needed = table.size - old_size + new_size - self.limit;
            table.evict(needed);
        }

        table.remove(&self.key);
        table.size += new_size;
        table.entries.insert(
            self.key,
            Entry {
                body: Bytes::from(self.buffer),
                headers: self.headers,
                expires_at,
            },
        );

        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::cache::props;

    fn cache() -> MemoryCache {
        MemoryCache::new(Config::default())
    }

    #[tokio::test]
    async fn test_round_trip() {
        props::round_trip(&cache()).await;
    }

    #[tokio::test]
    async fn test_last_modified() {
        props::last_modified(&cache()).await;
    }

    #[tokio::test]
    async fn test_not_visible_until_closed() {
        props::not_visible_until_closed(&cache()).await;
    }

    #[tokio::test]
    async fn test_atomic_replace() {
        props::atomic_replace(&cache()).await;
    }

    #[tokio::test]
    async fn test_abort_no_publish() {
        props::abort_no_publish(&cache()).await;
    }

    #[tokio::test]
    async fn test_expiration() {
        props::expiration(&cache()).await;
    }

    #[tokio::test]
    async fn test_default_ttl_clamp() {
        let max_ttl = Duration::from_millis(400);
        let cache = MemoryCache::new(Config {
            limit_mb: 16,
            max_ttl,
        });
        props::default_ttl_clamp(&cache, max_ttl).await;
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        props::delete_idempotent(&cache()).await;
    }

    #[tokio::test]
    async fn test_soak() {
        props::soak(&cache(), 500).await;
    }

    #[tokio::test]
    async fn test_eviction_on_write() {
        // 1 MiB limit, three entries of 512 KiB: the soonest-to-expire entry
        // is evicted to make room for the third.
        let cache = MemoryCache::new(Config {
            limit_mb: 1,
            max_ttl: DEFAULT_MAX_TTL,
        });
        let body = vec![0u8; 512 * 1024];

        let short = Key::of("evict/short");
        let long = Key::of("evict/long");
        let new = Key::of("evict/new");

        props::write_entry(
            &cache,
            &long,
            Headers::new(),
            &body,
            Duration::from_secs(3600),
        )
        .await;
        props::write_entry(
            &cache,
            &short,
            Headers::new(),
            &body,
            Duration::from_secs(60),
        )
        .await;
        props::write_entry(
            &cache,
            &new,
            Headers::new(),
            &body,
            Duration::from_secs(3600),
        )
        .await;

        assert!(matches!(cache.open(&short).await, Err(Error::NotFound)));
        assert!(cache.open(&long).await.is_ok());
        assert!(cache.open(&new).await.is_ok());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.size, 2 * 512 * 1024);
    }

    #[tokio::test]
    async fn test_oversized_entry_not_installed() {
        let cache = MemoryCache::new(Config {
            limit_mb: 1,
            max_ttl: DEFAULT_MAX_TTL,
        });
        let key = Key::of("evict/oversized");
        props::write_entry(
            &cache,
            &key,
            Headers::new(),
            &vec![0u8; 5 * 1024 * 1024],
            Duration::from_secs(3600),
        )
        .await;

        assert!(matches!(cache.open(&key).await, Err(Error::NotFound)));
        assert_eq!(cache.stats().await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_open_stream_survives_delete() {
        use tokio::io::AsyncReadExt as _;

        let cache = cache();
        let key = Key::of("survives-delete");
        props::write_entry(
            &cache,
            &key,
            Headers::new(),
            b"still readable",
            Duration::from_secs(60),
        )
        .await;

        let (mut stream, _) = cache.open(&key).await.unwrap();
        cache.delete(&key).await.unwrap();

        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"still readable");
    }
}
