//! Tiered composition of cache backends.
//!
//! Reads walk the tiers in order and return the first hit; writes go through
//! to every tier. The tiers are meant to be ordered fastest-first, e.g.
//! `[memory, disk]` or `[memory, s3]`. Visibility across tiers is loose: an
//! entry can be readable on one tier before another tier's write has landed.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;

use super::{Cache, Error, Stats, Stream, Writer};
use crate::headers::Headers;
use crate::key::Key;

/// Registry id of this backend.
pub const ID: &str = "tiered";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Member backends, fastest first.
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TierConfig {
    /// Registry id of the member backend.
    pub backend: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub(super) async fn factory(config: serde_json::Value) -> Result<Box<dyn Cache>, Error> {
    let config: Config =
        serde_json::from_value(config).map_err(|e| Error::Config(e.to_string()))?;

    let mut tiers = Vec::with_capacity(config.tiers.len());
    for tier in config.tiers {
        tiers.push(super::instantiate(&tier.backend, tier.config).await?);
    }
    Ok(Box::new(TieredCache::new(tiers)?))
}

pub struct TieredCache {
    tiers: Vec<Box<dyn Cache>>,
}

impl TieredCache {
    pub fn new(tiers: Vec<Box<dyn Cache>>) -> Result<Self, Error> {
        if tiers.is_empty() {
            return Err(Error::Config("tiered cache needs at least one tier".into()));
        }
        Ok(Self { tiers })
    }
}

#[async_trait]
impl Cache for TieredCache {
    async fn stat(&self, key: &Key) -> Result<Headers, Error> {
        for tier in &self.tiers {
            match tier.stat(key).await {
                Ok(headers) => return Ok(headers),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::NotFound)
    }

    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error> {
        for tier in &self.tiers {
            match tier.open(key).await {
                Ok(found) => return Ok(found),
                Err(Error::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::NotFound)
    }

    async fn create(
        &self,
        key: &Key,
        headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error> {
        let results = join_all(
            self.tiers
                .iter()
                .map(|tier| tier.create(key, headers.clone(), ttl)),
        )
        .await;

        let mut writers = Vec::with_capacity(results.len());
        let mut failed = None;
        for result in results {
            match result {
                Ok(writer) => writers.push(writer),
                Err(err) => failed = Some(err),
            }
        }
        if let Some(err) = failed {
            join_all(writers.into_iter().map(|writer| writer.abort())).await;
            return Err(err);
        }

        Ok(Box::new(TieredWriter {
            writers,
            failed: false,
        }))
    }

    async fn delete(&self, key: &Key) -> Result<(), Error> {
        let results = join_all(self.tiers.iter().map(|tier| tier.delete(key))).await;

        if results.iter().any(Result::is_ok) {
            return Ok(());
        }
        Err(Error::join(results.into_iter().filter_map(Result::err).collect())
            .unwrap_or(Error::NotFound))
    }

    async fn close(&self) -> Result<(), Error> {
        let results = join_all(self.tiers.iter().map(|tier| tier.close())).await;

        match Error::join(results.into_iter().filter_map(Result::err).collect()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn stats(&self) -> Result<Stats, Error> {
        for tier in &self.tiers {
            match tier.stats().await {
                Err(Error::StatsUnavailable) => continue,
                result => return result,
            }
        }
        Err(Error::StatsUnavailable)
    }
}

/// Write-through writer over every tier. A chunk is acknowledged once every
/// tier-writer accepted it; the first tier failure aborts the rest, so a
/// failed write publishes nowhere.
struct TieredWriter {
    writers: Vec<Box<dyn Writer>>,
    failed: bool,
}

#[async_trait]
impl Writer for TieredWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.failed {
            return Err(Error::Cancelled);
        }
        for writer in self.writers.iter_mut() {
            if let Err(err) = writer.write(chunk).await {
                self.failed = true;
                join_all(self.writers.drain(..).map(|writer| writer.abort())).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), Error> {
        if self.failed {
            return Err(Error::Cancelled);
        }
        let writers = std::mem::take(&mut self.writers);
        let results = join_all(writers.into_iter().map(|writer| writer.close())).await;

        match Error::join(results.into_iter().filter_map(Result::err).collect()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn abort(mut self: Box<Self>) {
        let writers = std::mem::take(&mut self.writers);
        join_all(writers.into_iter().map(|writer| writer.abort())).await;
    }
}
