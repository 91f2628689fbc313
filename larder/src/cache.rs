pub mod disk;
pub mod memory;
pub mod remote;
pub mod s3;
pub mod tiered;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::headers::Headers;
use crate::key::Key;

/// Maximum entry lifetime when a backend is not configured with one.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A readable entry body. Remains valid until dropped, even if the entry is
/// deleted or evicted concurrently.
pub type Stream = Box<dyn AsyncRead + Send + Unpin>;

/// Errors returned by every cache backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No entry exists under the key. Compare by value, not message.
    #[error("cache entry not found")]
    NotFound,
    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
    /// The backend does not track usage statistics.
    #[error("cache statistics unavailable")]
    StatsUnavailable,
    /// The backend could not serve the request. Transient; not retried here.
    #[error("cache backend unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// More than one backend failed.
    #[error("multiple cache errors: {0}")]
    Aggregate(Aggregate),
    /// Unknown backend id, or a malformed backend configuration.
    #[error("invalid cache configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn unavailable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Collapse the errors of a fan-out operation into one. All-`NotFound`
    /// stays `NotFound`; a single error is returned as itself; anything else
    /// becomes an aggregate preserving every message.
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        if errors.is_empty() {
            return None;
        }
        if errors.iter().all(Error::is_not_found) {
            return Some(Error::NotFound);
        }
        if errors.len() == 1 {
            return errors.pop();
        }
        Some(Error::Aggregate(Aggregate(errors)))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::unavailable(err),
        }
    }
}

/// A list of errors displayed as one message.
#[derive(Debug)]
pub struct Aggregate(Vec<Error>);

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl Aggregate {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

/// Usage statistics of a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of live entries.
    pub objects: u64,
    /// Total size of live entries, in bytes.
    pub size: u64,
    /// Configured size limit, in bytes.
    pub capacity: u64,
}

/// A store of cache entries addressed by [`Key`].
///
/// This is the one open seam of the core: backends implement it, the tiered
/// cache composes it, and everything else consumes it.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Entry headers without the body. Expired entries are absent.
    async fn stat(&self, key: &Key) -> Result<Headers, Error>;

    /// The entry body and headers. Expired entries are absent and deleted.
    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error>;

    /// Start writing an entry. Nothing is visible under `key` until the
    /// returned writer's `close` succeeds; `ttl` of zero means the backend's
    /// configured maximum, anything else is clamped to it.
    async fn create(
        &self,
        key: &Key,
        headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error>;

    /// Remove the entry. Concurrent readers holding an open stream keep
    /// reading to EOF. Removing an absent entry returns [`Error::NotFound`].
    async fn delete(&self, key: &Key) -> Result<(), Error>;

    /// Release background resources.
    async fn close(&self) -> Result<(), Error>;

    /// Usage statistics, when the backend tracks them.
    async fn stats(&self) -> Result<Stats, Error> {
        Err(Error::StatsUnavailable)
    }
}

impl fmt::Debug for dyn Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Cache")
    }
}

#[async_trait]
impl<T: Cache + ?Sized> Cache for std::sync::Arc<T> {
    async fn stat(&self, key: &Key) -> Result<Headers, Error> {
        (**self).stat(key).await
    }

    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error> {
        (**self).open(key).await
    }

    async fn create(
        &self,
        key: &Key,
        headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error> {
        (**self).create(key, headers, ttl).await
    }

    async fn delete(&self, key: &Key) -> Result<(), Error> {
        (**self).delete(key).await
    }

    async fn close(&self) -> Result<(), Error> {
        (**self).close().await
    }

    async fn stats(&self) -> Result<Stats, Error> {
        (**self).stats().await
    }
}

/// An in-progress entry write. Publication is all-or-nothing: only a
/// successful [`Writer::close`] makes the entry visible; `abort`, an error,
/// or dropping the writer leave the cache unchanged.
#[async_trait]
pub trait Writer: Send {
    /// Append a chunk to the pending entry.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error>;

    /// Atomically publish the entry.
    async fn close(self: Box<Self>) -> Result<(), Error>;

    /// Discard the pending entry.
    async fn abort(self: Box<Self>);
}

/// The effective lifetime of an entry: `ttl` clamped to `max_ttl`, with zero
/// meaning `max_ttl` itself.
pub(crate) fn effective_ttl(ttl: Duration, max_ttl: Duration) -> Duration {
    if ttl.is_zero() {
        max_ttl
    } else {
        ttl.min(max_ttl)
    }
}

type Factory =
    fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<Box<dyn Cache>, Error>> + Send>>;

/// The process-wide backend catalog. Populated once, read-only afterwards.
static BACKENDS: Lazy<HashMap<&'static str, Factory>> = Lazy::new(|| {
    let mut backends: HashMap<&'static str, Factory> = HashMap::new();
    backends.insert(memory::ID, |config| Box::pin(memory::factory(config)));
    backends.insert(disk::ID, |config| Box::pin(disk::factory(config)));
    backends.insert(s3::ID, |config| Box::pin(s3::factory(config)));
    backends.insert(tiered::ID, |config| Box::pin(tiered::factory(config)));
    backends.insert(remote::ID, |config| Box::pin(remote::factory(config)));
    backends
});

/// Instantiate the backend registered under `id` from its configuration
/// value.
pub async fn instantiate(id: &str, config: serde_json::Value) -> Result<Box<dyn Cache>, Error> {
    let factory = BACKENDS
        .get(id)
        .ok_or_else(|| Error::Config(format!("unknown cache backend '{id}'")))?;

    factory(config).await
}

/// The ids of all registered backends.
pub fn backends() -> impl Iterator<Item = &'static str> {
    BACKENDS.keys().copied()
}
