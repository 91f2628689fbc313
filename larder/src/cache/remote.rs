//! Cache backend backed by another proxy instance's object API.
//!
//! Entries are read and written over HTTP: `GET`/`HEAD`/`POST`/`DELETE`
//! `{url}/api/v1/object/{hex}` plus `GET {url}/api/v1/stats`, streaming
//! bodies in both directions. Useful for pointing a small edge instance at a
//! larger shared cache.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use super::{Cache, Error, Stats, Stream, Writer};
use crate::fetch::{header_map, headers_of};
use crate::headers::{Headers, TIME_TO_LIVE};
use crate::key::Key;

/// Registry id of this backend.
pub const ID: &str = "remote";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Base URL of the remote instance, e.g. `http://cache.internal:8080`.
    pub url: String,
}

pub(super) async fn factory(config: serde_json::Value) -> Result<Box<dyn Cache>, Error> {
    let config: Config =
        serde_json::from_value(config).map_err(|e| Error::Config(e.to_string()))?;

    Ok(Box::new(RemoteCache::new(config)?))
}

pub struct RemoteCache {
    client: reqwest::Client,
    url: String,
}

impl RemoteCache {
    pub fn new(config: Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(Error::unavailable)?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    fn object_url(&self, key: &Key) -> String {
        format!("{}/api/v1/object/{key}", self.url)
    }
}

#[async_trait]
impl Cache for RemoteCache {
    async fn stat(&self, key: &Key) -> Result<Headers, Error> {
        let response = self
            .client
            .head(self.object_url(key))
            .send()
            .await
            .map_err(Error::unavailable)?;

        entry_headers(&response)
    }

    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error> {
        let response = self
            .client
            .get(self.object_url(key))
            .send()
            .await
            .map_err(Error::unavailable)?;
        let headers = entry_headers(&response)?;

        Ok((stream_body(response), headers))
    }

    async fn create(
        &self,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error> {
        headers.ensure_last_modified(Utc::now());

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        let mut request = self
            .client
            .post(self.object_url(key))
            .headers(header_map(&headers));
        if !ttl.is_zero() {
            request = request.header(TIME_TO_LIVE, humantime::format_duration(ttl).to_string());
        }

        let upload: JoinHandle<Result<(), Error>> = tokio::spawn(async move {
            let response = request
                .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
                .send()
                .await
                .map_err(Error::unavailable)?;
            if !response.status().is_success() {
                return Err(Error::unavailable(std::io::Error::other(format!(
                    "remote cache returned {}",
                    response.status()
                ))));
            }
            Ok(())
        });

        Ok(Box::new(RemoteWriter {
            tx: Some(tx),
            upload: Some(upload),
        }))
    }

    async fn delete(&self, key: &Key) -> Result<(), Error> {
        let response = self
            .client
            .delete(self.object_url(key))
            .send()
            .await
            .map_err(Error::unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status if status.is_success() => Ok(()),
            status => Err(Error::unavailable(std::io::Error::other(format!(
                "remote cache returned {status}"
            )))),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn stats(&self) -> Result<Stats, Error> {
        let response = self
            .client
            .get(format!("{}/api/v1/stats", self.url))
            .send()
            .await
            .map_err(Error::unavailable)?;

        match response.status() {
            StatusCode::NOT_IMPLEMENTED => Err(Error::StatsUnavailable),
            status if status.is_success() => {
                response.json::<Stats>().await.map_err(Error::unavailable)
            }
            status => Err(Error::unavailable(std::io::Error::other(format!(
                "remote cache returned {status}"
            )))),
        }
    }
}

/// Entry headers of an object response, with transfer noise stripped.
fn entry_headers(response: &reqwest::Response) -> Result<Headers, Error> {
    match response.status() {
        StatusCode::NOT_FOUND => Err(Error::NotFound),
        status if status.is_success() => {
            let mut headers = headers_of(response.headers());
            headers.strip_transport();
            Ok(headers)
        }
        status => Err(Error::unavailable(std::io::Error::other(format!(
            "remote cache returned {status}"
        )))),
    }
}

fn stream_body(response: reqwest::Response) -> Stream {
    use futures::StreamExt as _;

    let stream = Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    );
    Box::new(StreamReader::new(stream))
}

struct RemoteWriter {
    tx: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    upload: Option<JoinHandle<Result<(), Error>>>,
}

impl RemoteWriter {
    async fn join(&mut self) -> Result<(), Error> {
        match self.upload.take() {
            None => Ok(()),
            Some(upload) => upload.await.map_err(Error::unavailable)?,
        }
    }
}

#[async_trait]
impl Writer for RemoteWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let tx = self.tx.as_ref().ok_or(Error::Cancelled)?;
        if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
            // The upload ended early; surface its error.
            self.tx = None;
            self.join().await?;
            return Err(Error::unavailable(std::io::Error::other(
                "remote upload ended early",
            )));
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), Error> {
        // Dropping the sender completes the request body.
        self.tx.take();
        self.join().await
    }

    async fn abort(mut self: Box<Self>) {
        // Failing the request body keeps the remote side from publishing.
        if let Some(tx) = self.tx.take() {
            let _ = tx
                .send(Err(std::io::Error::other("cache write aborted")))
                .await;
        }
        if let Some(upload) = self.upload.take() {
            let _ = upload.await;
        }
    }
}
