//! Cache-aware HTTP fetching.
//!
//! [`fetch`] is the single entry point every ecosystem strategy delegates
//! to: it serves the cached copy when there is one, and otherwise performs
//! the upstream request, streaming the body to the client and into the cache
//! at the same time.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::cache::{self, Cache, Writer};
use crate::headers::Headers;
use crate::key::Key;

/// Errors returned by [`fetch`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upstream request failed at the transport level. Surfaced to
    /// clients as `502 Bad Gateway`.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    /// The cache could not be consulted or written. Surfaced to clients as
    /// `500 Internal Server Error`.
    #[error("cache error: {0}")]
    Cache(#[from] cache::Error),
}

/// A response to relay to the client: either the cached entry or the live
/// upstream response.
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: cache::Stream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Serve `request` from `cache` if possible, and otherwise from upstream,
/// filling the cache on the way through.
///
/// The cache key is the SHA-256 of the request URL. Only `200 OK` upstream
/// responses are cached; anything else is relayed unchanged. On a miss the
/// upstream body is tee'd: chunks stream to the client and into a cache
/// writer simultaneously, and the entry is published when the body completes.
/// If the upstream read fails mid-stream the pending entry is discarded; if
/// only the cache write fails, the entry is discarded but the client keeps
/// streaming.
///
/// Concurrent fetches of one URL race independently; the cache's atomic
/// publish picks a winner.
pub async fn fetch(
    client: &reqwest::Client,
    request: reqwest::Request,
    cache: &dyn Cache,
) -> Result<Response, Error> {
    let url = request.url().clone();
    let key = Key::of(url.as_str());

    match cache.open(&key).await {
        Ok((body, headers)) => {
            tracing::debug!(upstream = %url, key = %key, "serving cached copy");
            return Ok(Response {
                status: StatusCode::OK,
                headers,
                body,
            });
        }
        Err(cache::Error::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    let upstream = client.execute(request).await?;
    let status = upstream.status();
    let headers = headers_of(upstream.headers());

    if status != StatusCode::OK {
        tracing::debug!(upstream = %url, status = %status, "relaying uncached upstream response");
        return Ok(Response {
            status,
            headers,
            body: relay(upstream, None),
        });
    }

    let mut cached = headers.clone();
    cached.strip_transport();
    let writer = cache.create(&key, cached, Duration::ZERO).await?;

    tracing::debug!(upstream = %url, key = %key, "filling cache from upstream");
    Ok(Response {
        status,
        headers,
        body: relay(upstream, Some(writer)),
    })
}

/// Stream the upstream body to the returned reader, teeing every chunk into
/// `writer` when one is given.
fn relay(mut upstream: reqwest::Response, mut writer: Option<Box<dyn Writer>>) -> cache::Stream {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);

    tokio::spawn(async move {
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    if let Some(w) = writer.as_mut() {
                        if let Err(err) = w.write(&chunk).await {
                            tracing::warn!(error = %err, "cache write failed, discarding entry");
                            if let Some(w) = writer.take() {
                                w.abort().await;
                            }
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // The client went away; nothing complete to publish.
                        if let Some(w) = writer.take() {
                            w.abort().await;
                        }
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    if let Some(w) = writer.take() {
                        w.abort().await;
                    }
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    return;
                }
            }
        }
        if let Some(w) = writer.take() {
            if let Err(err) = w.close().await {
                tracing::warn!(error = %err, "failed to publish cache entry");
            }
        }
    });

    Box::new(StreamReader::new(ReceiverStream::new(rx)))
}

/// Collect an HTTP header map into cacheable [`Headers`].
pub fn headers_of(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map.iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str(), value);
        }
    }
    headers
}

/// Render [`Headers`] back into an HTTP header map. Names or values that are
/// not valid HTTP are skipped.
pub fn header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers.iter() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}
