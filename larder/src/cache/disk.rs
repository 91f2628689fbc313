//! On-disk cache backend.
//!
//! Entry bodies are plain files under `{root}/{k0k1}/{hex}`, where `k0k1` is
//! a two-digit shard prefix. Metadata (expiry, effective TTL, headers) lives
//! in an embedded SQLite database at `{root}/metadata.db`. Writes land in a
//! temporary file that is atomically renamed into place on close, so a
//! partially-written entry is never visible. A background evictor sweeps
//! expired and orphaned entries and enforces the size limit oldest-accessed
//! first; a successful `open` re-extends an entry's expiry, which turns TTL
//! eviction into an LRU discipline under steady access.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlite as sql;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{effective_ttl, Cache, Error, Stats, Stream, Writer, DEFAULT_MAX_TTL};
use crate::headers::Headers;
use crate::key::Key;

/// Registry id of this backend.
pub const ID: &str = "disk";

/// How long to wait for the metadata database lock before failing.
const DB_TIMEOUT: Duration = Duration::from_secs(6);

/// Grace period before an unrecorded file (a crashed writer's leftover) is
/// swept. Keeps the evictor away from writes that are still in flight.
const ORPHAN_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Directory holding entry files and the metadata database.
    pub root: PathBuf,
    /// Total size of cached bodies, in MiB.
    #[serde(default = "defaults::limit_mb")]
    pub limit_mb: u64,
    /// Maximum entry lifetime.
    #[serde(with = "crate::serde_ext::duration", default = "defaults::max_ttl")]
    pub max_ttl: Duration,
    /// How often the background evictor runs when not kicked by a writer.
    #[serde(with = "crate::serde_ext::duration", default = "defaults::evict_interval")]
    pub evict_interval: Duration,
}

mod defaults {
    use std::time::Duration;

    pub fn limit_mb() -> u64 {
        1024
    }

    pub fn max_ttl() -> Duration {
        super::DEFAULT_MAX_TTL
    }

    pub fn evict_interval() -> Duration {
        Duration::from_secs(60)
    }
}

pub(super) async fn factory(config: serde_json::Value) -> Result<Box<dyn Cache>, Error> {
    let config: Config =
        serde_json::from_value(config).map_err(|e| Error::Config(e.to_string()))?;
    let cache = DiskCache::open(config).await?;

    Ok(Box::new(cache))
}

/// Metadata row of one entry.
struct Meta {
    expires_at: DateTime<Utc>,
    ttl: Duration,
    headers: String,
}

struct Inner {
    root: PathBuf,
    limit: u64,
    max_ttl: Duration,
    db: Mutex<sql::Connection>,
    /// Total size of published entry files. May briefly overshoot while a
    /// writer is between rename and counter update; the evictor re-derives
    /// it every pass.
    size: AtomicU64,
    kick: mpsc::Sender<()>,
}

pub struct DiskCache {
    inner: Arc<Inner>,
    evictor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DiskCache {
    const SCHEMA: &'static str = include_str!("disk/schema.sql");

    pub async fn open(config: Config) -> Result<Self, Error> {
        tokio::fs::create_dir_all(&config.root).await?;

        let mut db = sql::Connection::open(config.root.join("metadata.db"))
            .map_err(Error::unavailable)?;
        db.set_busy_timeout(DB_TIMEOUT.as_millis() as usize)
            .map_err(Error::unavailable)?;
        db.execute(Self::SCHEMA).map_err(Error::unavailable)?;

        let (kick, kicked) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            root: config.root,
            limit: config.limit_mb * 1024 * 1024,
            max_ttl: config.max_ttl,
            db: Mutex::new(db),
            size: AtomicU64::new(0),
            kick,
        });
        let shutdown = CancellationToken::new();
        let evictor = tokio::spawn(evictor(
            inner.clone(),
            kicked,
            config.evict_interval,
            shutdown.clone(),
        ));

        // Prime the size counter and sweep anything left from a crash.
        let _ = inner.kick.try_send(());

        Ok(Self {
            inner,
            evictor: Mutex::new(Some(evictor)),
            shutdown,
        })
    }

    /// Run one eviction pass right away. Used by tests.
    #[cfg(test)]
    pub async fn evict_now(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.evict_pass())
            .await
            .map_err(Error::unavailable)?
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn stat(&self, key: &Key) -> Result<Headers, Error> {
        let meta = self.inner.meta_get(key)?.ok_or(Error::NotFound)?;
        let headers = match self.inner.decode_headers(key, &meta) {
            Some(headers) => headers,
            None => return Err(Error::NotFound),
        };
        if meta.expires_at <= Utc::now() {
            self.inner.remove_entry(key);
            return Err(Error::NotFound);
        }
        if tokio::fs::metadata(self.inner.entry_path(key)).await.is_err() {
            // Orphaned row: the file is gone.
            let _ = self.inner.meta_delete(key);
            return Err(Error::NotFound);
        }
        Ok(headers)
    }

    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error> {
        let meta = self.inner.meta_get(key)?.ok_or(Error::NotFound)?;
        let headers = match self.inner.decode_headers(key, &meta) {
            Some(headers) => headers,
            None => return Err(Error::NotFound),
        };
        if meta.expires_at <= Utc::now() {
            self.inner.remove_entry(key);
            return Err(Error::NotFound);
        }

        let file = match tokio::fs::File::open(self.inner.entry_path(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let _ = self.inner.meta_delete(key);
                return Err(Error::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        // LRU touch: re-extend the expiry by the entry's own lifetime.
        let expires_at = Utc::now() + clamped(effective_ttl(meta.ttl, self.inner.max_ttl))?;
        self.inner.meta_touch(key, expires_at)?;

        Ok((Box::new(file) as Stream, headers))
    }

    async fn create(
        &self,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error> {
        headers.ensure_last_modified(Utc::now());

        let dir = self.inner.shard_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{key}.{:08x}.tmp", fastrand::u32(..)));
        let file = tokio::fs::File::create(&tmp).await?;

        Ok(Box::new(DiskWriter {
            inner: self.inner.clone(),
            key: *key,
            headers,
            ttl: effective_ttl(ttl, self.inner.max_ttl),
            path: self.inner.entry_path(key),
            tmp,
            file: Some(file),
            done: false,
        }))
    }

    async fn delete(&self, key: &Key) -> Result<(), Error> {
        let had_row = self.inner.meta_delete(key)?;
        let path = self.inner.entry_path(key);
        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let had_file = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        self.inner.shrink(len);

        if had_row || had_file {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        let evictor = self
            .evictor
            .lock()
            .expect("disk cache lock is not poisoned")
            .take();
        if let Some(evictor) = evictor {
            let _ = evictor.await;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Stats, Error> {
        Ok(Stats {
            objects: self.inner.meta_count()?,
            size: self.inner.size.load(Ordering::Relaxed),
            capacity: self.inner.limit,
        })
    }
}

impl Inner {
    fn shard_dir(&self, key: &Key) -> PathBuf {
        self.root.join(key.shard())
    }

    fn entry_path(&self, key: &Key) -> PathBuf {
        self.shard_dir(key).join(key.to_string())
    }

    fn shrink(&self, len: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| {
                Some(size.saturating_sub(len))
            });
    }

    /// Decode a row's headers. A row that fails to decode is corrupt: the
    /// entry is discarded and reads treat it as absent.
    fn decode_headers(&self, key: &Key, meta: &Meta) -> Option<Headers> {
        match serde_json::from_str(&meta.headers) {
            Ok(headers) => Some(headers),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "discarding cache entry with corrupt metadata");
                self.remove_entry(key);
                None
            }
        }
    }

    /// Remove an entry's file and metadata row, adjusting the size counter.
    fn remove_entry(&self, key: &Key) {
        let path = self.entry_path(key);
        if let Ok(md) = std::fs::metadata(&path) {
            if std::fs::remove_file(&path).is_ok() {
                self.shrink(md.len());
            }
        }
        let _ = self.meta_delete(key);
    }

    fn meta_get(&self, key: &Key) -> Result<Option<Meta>, Error> {
        let row = {
            let db = self.db.lock().expect("metadata lock is not poisoned");
            let mut stmt = db
                .prepare("SELECT `expires-at`, `ttl`, `headers` FROM `entries` WHERE `key` = ?1")
                .map_err(Error::unavailable)?;
            stmt.bind((1, key.to_string().as_str()))
                .map_err(Error::unavailable)?;

            let result = stmt.into_iter().next().map(|row| {
                row.map(|row| {
                    (
                        row.try_read::<i64, _>("expires-at")
                            .ok()
                            .and_then(DateTime::from_timestamp_millis),
                        row.try_read::<i64, _>("ttl").ok(),
                        row.try_read::<&str, _>("headers").ok().map(ToOwned::to_owned),
                    )
                })
            });
            result
        };

        match row {
            None => Ok(None),
            Some(Err(err)) => Err(Error::unavailable(err)),
            Some(Ok((Some(expires_at), Some(ttl), Some(headers)))) => Ok(Some(Meta {
                expires_at,
                ttl: Duration::from_millis(ttl.max(0) as u64),
                headers,
            })),
            Some(Ok(_)) => {
                tracing::warn!(key = %key, "discarding cache entry with corrupt metadata row");
                self.remove_entry(key);
                Ok(None)
            }
        }
    }

    fn meta_put(
        &self,
        key: &Key,
        expires_at: DateTime<Utc>,
        ttl: Duration,
        headers: &str,
    ) -> Result<(), Error> {
        let db = self.db.lock().expect("metadata lock is not poisoned");
        let mut stmt = db
            .prepare(
                "INSERT INTO `entries` (`key`, `expires-at`, `ttl`, `headers`)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(`key`) DO UPDATE
                 SET `expires-at` = ?2, `ttl` = ?3, `headers` = ?4",
            )
            .map_err(Error::unavailable)?;
        stmt.bind((1, key.to_string().as_str()))
            .map_err(Error::unavailable)?;
        stmt.bind((2, expires_at.timestamp_millis()))
            .map_err(Error::unavailable)?;
        stmt.bind((3, ttl.as_millis() as i64))
            .map_err(Error::unavailable)?;
        stmt.bind((4, headers)).map_err(Error::unavailable)?;
        stmt.next().map_err(Error::unavailable)?;

        Ok(())
    }

    fn meta_touch(&self, key: &Key, expires_at: DateTime<Utc>) -> Result<(), Error> {
        let db = self.db.lock().expect("metadata lock is not poisoned");
        let mut stmt = db
            .prepare("UPDATE `entries` SET `expires-at` = ?2 WHERE `key` = ?1")
            .map_err(Error::unavailable)?;
        stmt.bind((1, key.to_string().as_str()))
            .map_err(Error::unavailable)?;
        stmt.bind((2, expires_at.timestamp_millis()))
            .map_err(Error::unavailable)?;
        stmt.next().map_err(Error::unavailable)?;

        Ok(())
    }

    fn meta_delete(&self, key: &Key) -> Result<bool, Error> {
        let db = self.db.lock().expect("metadata lock is not poisoned");
        let mut stmt = db
            .prepare("DELETE FROM `entries` WHERE `key` = ?1")
            .map_err(Error::unavailable)?;
        stmt.bind((1, key.to_string().as_str()))
            .map_err(Error::unavailable)?;
        stmt.next().map_err(Error::unavailable)?;

        Ok(db.change_count() > 0)
    }

    fn meta_delete_many(&self, keys: &[Key]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().expect("metadata lock is not poisoned");
        db.execute("BEGIN IMMEDIATE").map_err(Error::unavailable)?;

        let result = (|| {
            let mut stmt = db.prepare("DELETE FROM `entries` WHERE `key` = ?1")?;
            for key in keys {
                stmt.reset()?;
                stmt.bind((1, key.to_string().as_str()))?;
                stmt.next()?;
            }
            Ok::<_, sql::Error>(())
        })();

        match result {
            Ok(()) => db.execute("COMMIT").map_err(Error::unavailable),
            Err(err) => {
                let _ = db.execute("ROLLBACK");
                Err(Error::unavailable(err))
            }
        }
    }

    fn meta_walk(&self) -> Result<Vec<(Key, DateTime<Utc>)>, Error> {
        let db = self.db.lock().expect("metadata lock is not poisoned");
        let stmt = db
            .prepare("SELECT `key`, `expires-at` FROM `entries`")
            .map_err(Error::unavailable)?;

        let mut rows = Vec::new();
        for row in stmt.into_iter() {
            let row = row.map_err(Error::unavailable)?;
            let key = row
                .try_read::<&str, _>("key")
                .ok()
                .and_then(|s| s.parse::<Key>().ok());
            let expires_at = row
                .try_read::<i64, _>("expires-at")
                .ok()
                .and_then(DateTime::from_timestamp_millis);

            if let (Some(key), Some(expires_at)) = (key, expires_at) {
                rows.push((key, expires_at));
            }
        }
        Ok(rows)
    }

    fn meta_count(&self) -> Result<u64, Error> {
        let db = self.db.lock().expect("metadata lock is not poisoned");
        let stmt = db
            .prepare("SELECT COUNT(*) AS `count` FROM `entries`")
            .map_err(Error::unavailable)?;

        let result = if let Some(Ok(row)) = stmt.into_iter().next() {
            Ok(row.try_read::<i64, _>("count").unwrap_or(0).max(0) as u64)
        } else {
            Ok(0)
        };
        result
    }

    /// One eviction pass: sweep orphaned rows, expired entries and stray
    /// files, re-derive the size counter, then enforce the size limit
    /// oldest-accessed first.
    fn evict_pass(&self) -> Result<(), Error> {
        let now = Utc::now();
        let rows = self.meta_walk()?;

        let mut stale = Vec::new();
        let mut live = Vec::new();
        let mut total: u64 = 0;

        for (key, expires_at) in rows {
            let path = self.entry_path(&key);
            match std::fs::metadata(&path) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => stale.push(key),
                Err(err) => return Err(err.into()),
                Ok(md) => {
                    if expires_at <= now {
                        if let Err(err) = std::fs::remove_file(&path) {
                            tracing::warn!(key = %key, error = %err, "failed to remove expired cache entry");
                            continue;
                        }
                        stale.push(key);
                    } else {
                        let mtime = md.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                        total += md.len();
                        live.push((key, md.len(), mtime));
                    }
                }
            }
        }

        self.sweep_strays(&live);
        self.meta_delete_many(&stale)?;
        self.size.store(total, Ordering::Relaxed);

        if total <= self.limit {
            return Ok(());
        }

        live.sort_by_key(|(_, _, mtime)| *mtime);

        let mut evicted = Vec::new();
        for (key, len, _) in live {
            if total <= self.limit {
                break;
            }
            if let Err(err) = std::fs::remove_file(self.entry_path(&key)) {
                tracing::warn!(key = %key, error = %err, "failed to evict cache entry");
                continue;
            }
            total -= len;
            evicted.push(key);
        }
        tracing::debug!(evicted = evicted.len(), size = total, "disk cache eviction pass");
        self.meta_delete_many(&evicted)?;
        self.size.store(total, Ordering::Relaxed);

        Ok(())
    }

    /// Remove shard-directory files with no metadata row: leftovers of a
    /// crash between rename and the metadata write. Recent files are left
    /// alone so in-flight writers are not swept.
    fn sweep_strays(&self, live: &[(Key, u64, SystemTime)]) {
        let known: std::collections::HashSet<String> =
            live.iter().map(|(key, _, _)| key.to_string()).collect();
        let cutoff = SystemTime::now() - ORPHAN_GRACE;

        let Ok(shards) = std::fs::read_dir(&self.root) else {
            return;
        };
        for shard in shards.flatten() {
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(files) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name().to_string_lossy().into_owned();
                if known.contains(&name) {
                    continue;
                }
                let old = file
                    .metadata()
                    .and_then(|md| md.modified())
                    .map(|mtime| mtime < cutoff)
                    .unwrap_or(false);
                if old {
                    let _ = std::fs::remove_file(file.path());
                }
            }
        }
    }
}

/// Background eviction loop: runs on a ticker and whenever a writer kicks
/// it.
async fn evictor(
    inner: Arc<Inner>,
    mut kicked: mpsc::Receiver<()>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            kick = kicked.recv() => {
                if kick.is_none() {
                    break;
                }
            }
        }

        let pass = inner.clone();
        match tokio::task::spawn_blocking(move || pass.evict_pass()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "disk cache eviction pass failed"),
            Err(err) => tracing::error!(error = %err, "disk cache evictor panicked"),
        }
    }
}

fn clamped(ttl: Duration) -> Result<chrono::Duration, Error> {
    chrono::Duration::from_std(ttl).map_err(Error::unavailable)
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct DiskWriter {
    inner: Arc<Inner>,
    key: Key,
    headers: Headers,
    /// Effective lifetime, already clamped to the backend maximum.
    ttl: Duration,
    path: PathBuf,
    tmp: PathBuf,
    file: Option<tokio::fs::File>,
    done: bool,
}

#[async_trait]
impl Writer for DiskWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let file = self.file.as_mut().ok_or(Error::Cancelled)?;
        file.write_all(chunk).await?;

        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), Error> {
        let mut file = self.file.take().ok_or(Error::Cancelled)?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let new_len = tokio::fs::metadata(&self.tmp).await?.len();
        let old_len = tokio::fs::metadata(&self.path)
            .await
            .map(|md| md.len())
            .unwrap_or(0);

        tokio::fs::rename(&self.tmp, &self.path).await?;
        self.done = true;

        let expires_at = Utc::now() + clamped(self.ttl)?;
        let headers = serde_json::to_string(&self.headers).map_err(Error::unavailable)?;
        self.inner.meta_put(&self.key, expires_at, self.ttl, &headers)?;

        self.inner.size.fetch_add(new_len, Ordering::Relaxed);
        self.inner.shrink(old_len);
        let _ = self.inner.kick.try_send(());

        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.file.take();
        self.done = true;
        let _ = tokio::fs::remove_file(&self.tmp).await;
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        // A writer dropped before `close` publishes nothing.
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}
