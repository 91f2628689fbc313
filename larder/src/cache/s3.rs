//! S3-compatible object-store backend.
//!
//! Entries are objects named `{k0k1}/{hex}`; expiry and cached headers ride
//! along as object user-metadata. Uploads are multipart: parts stream out as
//! the writer fills its buffer, and the upload is only completed, making the
//! object visible, on a successful `close`. Any other outcome aborts the
//! upload.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::{effective_ttl, Cache, Error, Stream, Writer, DEFAULT_MAX_TTL};
use crate::headers::Headers;
use crate::key::Key;

/// Registry id of this backend.
pub const ID: &str = "s3";

/// User-metadata key carrying the absolute expiry.
const META_EXPIRES_AT: &str = "expires-at";
/// User-metadata key carrying the JSON-encoded header map.
const META_HEADERS: &str = "headers";

/// S3 requires every part except the last to be at least 5 MiB.
const MIN_PART_SIZE_MB: u64 = 5;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload part size, in MiB. Clamped to the S3 minimum of 5.
    #[serde(default = "defaults::part_size_mb")]
    pub part_size_mb: u64,
    /// Maximum part uploads in flight per writer.
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
    /// Maximum entry lifetime.
    #[serde(with = "crate::serde_ext::duration", default = "defaults::max_ttl")]
    pub max_ttl: Duration,
}

mod defaults {
    use std::time::Duration;

    pub fn part_size_mb() -> u64 {
        super::MIN_PART_SIZE_MB
    }

    pub fn concurrency() -> usize {
        4
    }

    pub fn max_ttl() -> Duration {
        super::DEFAULT_MAX_TTL
    }
}

pub(super) async fn factory(config: serde_json::Value) -> Result<Box<dyn Cache>, Error> {
    let config: Config =
        serde_json::from_value(config).map_err(|e| Error::Config(e.to_string()))?;
    let cache = S3Cache::open(config).await;

    Ok(Box::new(cache))
}

pub struct S3Cache {
    client: Client,
    bucket: String,
    part_size: usize,
    concurrency: usize,
    max_ttl: Duration,
}

impl S3Cache {
    pub async fn open(config: Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = config.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = config.endpoint.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk = loader.load().await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk)
                .force_path_style(config.force_path_style)
                .build(),
        );

        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: Config) -> Self {
        Self {
            client,
            bucket: config.bucket,
            part_size: (config.part_size_mb.max(MIN_PART_SIZE_MB) * 1024 * 1024) as usize,
            concurrency: config.concurrency.max(1),
            max_ttl: config.max_ttl,
        }
    }

    /// Expiry and cached headers of an object, from a HEAD request. Expired
    /// or corrupt objects are deleted and read as absent.
    async fn head(&self, key: &Key) -> Result<Headers, Error> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_name(key))
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Error::NotFound
                } else {
                    Error::unavailable(err)
                }
            })?;

        let meta = output.metadata().cloned().unwrap_or_default();
        let Some(decoded) = decode_meta(&meta) else {
            tracing::warn!(key = %key, "discarding object with corrupt metadata");
            self.remove(key).await;
            return Err(Error::NotFound);
        };
        let (expires_at, headers) = decoded;
        if expires_at <= Utc::now() {
            self.remove(key).await;
            return Err(Error::NotFound);
        }
        Ok(headers)
    }

    async fn remove(&self, key: &Key) {
        if let Err(err) = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_name(key))
            .send()
            .await
        {
            tracing::warn!(key = %key, error = %err, "failed to delete object");
        }
    }
}

#[async_trait]
impl Cache for S3Cache {
    async fn stat(&self, key: &Key) -> Result<Headers, Error> {
        self.head(key).await
    }

    async fn open(&self, key: &Key) -> Result<(Stream, Headers), Error> {
        let headers = self.head(key).await?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_name(key))
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    Error::NotFound
                } else {
                    Error::unavailable(err)
                }
            })?;

        Ok((stream_body(output.body), headers))
    }

    async fn create(
        &self,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn Writer>, Error> {
        headers.ensure_last_modified(Utc::now());

        let ttl = effective_ttl(ttl, self.max_ttl);
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).map_err(Error::unavailable)?;
        let encoded = serde_json::to_string(&headers).map_err(Error::unavailable)?;

        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_name(key))
            .metadata(META_EXPIRES_AT, expires_at.to_rfc3339())
            .metadata(META_HEADERS, encoded)
            .send()
            .await
            .map_err(Error::unavailable)?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| Error::unavailable(std::io::Error::other("missing upload id")))?
            .to_owned();

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            object: object_name(key),
            upload_id,
            part_size: self.part_size,
            concurrency: self.concurrency,
            buffer: Vec::new(),
            next_part: 1,
            parts: Vec::new(),
            uploads: JoinSet::new(),
            done: false,
        }))
    }

    async fn delete(&self, key: &Key) -> Result<(), Error> {
        // S3 deletes are quiet about missing objects; check first so the
        // caller can tell.
        self.head(key).await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_name(key))
            .send()
            .await
            .map_err(Error::unavailable)?;

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn object_name(key: &Key) -> String {
    format!("{}/{}", key.shard(), key)
}

fn meta_value<'a>(meta: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    meta.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn decode_meta(meta: &HashMap<String, String>) -> Option<(DateTime<Utc>, Headers)> {
    let expires_at = DateTime::parse_from_rfc3339(meta_value(meta, META_EXPIRES_AT)?)
        .ok()?
        .with_timezone(&Utc);
    let headers = serde_json::from_str(meta_value(meta, META_HEADERS)?).ok()?;

    Some((expires_at, headers))
}

/// Bridge a response body into an [`AsyncRead`](tokio::io::AsyncRead)
/// stream.
fn stream_body(mut body: ByteStream) -> Stream {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
    tokio::spawn(async move {
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
    });

    Box::new(tokio_util::io::StreamReader::new(
        tokio_stream::wrappers::ReceiverStream::new(rx),
    ))
}

struct S3Writer {
    client: Client,
    bucket: String,
    object: String,
    upload_id: String,
    part_size: usize,
    concurrency: usize,
    buffer: Vec<u8>,
    next_part: i32,
    parts: Vec<CompletedPart>,
    uploads: JoinSet<Result<CompletedPart, Error>>,
    done: bool,
}

impl S3Writer {
    fn spawn_part(&mut self, body: Vec<u8>) {
        let part_number = self.next_part;
        self.next_part += 1;

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let object = self.object.clone();
        let upload_id = self.upload_id.clone();

        self.uploads.spawn(async move {
            let output = client
                .upload_part()
                .bucket(bucket)
                .key(object)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(Bytes::from(body)))
                .send()
                .await
                .map_err(Error::unavailable)?;

            Ok(CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(output.e_tag().map(ToOwned::to_owned))
                .build())
        });
    }

    async fn join_one(&mut self) -> Result<(), Error> {
        match self.uploads.join_next().await {
            None => Ok(()),
            Some(Err(err)) => Err(Error::unavailable(err)),
            Some(Ok(Err(err))) => Err(err),
            Some(Ok(Ok(part))) => {
                self.parts.push(part);
                Ok(())
            }
        }
    }

    async fn finish(&mut self) -> Result<(), Error> {
        // The final part may be under the 5 MiB minimum; an empty entry is a
        // single empty part.
        if !self.buffer.is_empty() || self.next_part == 1 {
            let body = std::mem::take(&mut self.buffer);
            self.spawn_part(body);
        }
        while !self.uploads.is_empty() {
            self.join_one().await?;
        }
        self.parts
            .sort_by_key(|part| part.part_number().unwrap_or(i32::MAX));

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.object)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(Error::unavailable)?;

        Ok(())
    }

    async fn abort_upload(&mut self) {
        self.uploads.abort_all();
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.object)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(object = %self.object, error = %err, "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl Writer for S3Writer {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(chunk);

        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buffer, rest);

            while self.uploads.len() >= self.concurrency {
                self.join_one().await?;
            }
            self.spawn_part(part);
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), Error> {
        self.done = true;
        match self.finish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort_upload().await;
                Err(err)
            }
        }
    }

    async fn abort(mut self: Box<Self>) {
        self.done = true;
        self.abort_upload().await;
    }
}

impl Drop for S3Writer {
    fn drop(&mut self) {
        // A writer dropped before `close` must not leave the upload open.
        if !self.done {
            self.uploads.abort_all();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let client = self.client.clone();
                let bucket = std::mem::take(&mut self.bucket);
                let object = std::mem::take(&mut self.object);
                let upload_id = std::mem::take(&mut self.upload_id);
                handle.spawn(async move {
                    let _ = client
                        .abort_multipart_upload()
                        .bucket(bucket)
                        .key(object)
                        .upload_id(upload_id)
                        .send()
                        .await;
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_object_name() {
        let key = Key::of("https://github.com/o/r/releases/download/v1/tool.tar.gz");
        let name = object_name(&key);

        assert_eq!(name, format!("{}/{}", key.shard(), key));
        assert_eq!(name.len(), 2 + 1 + 64);
    }

    #[test]
    fn test_meta_round_trip() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/gzip");
        let expires_at = Utc::now() + chrono::Duration::hours(1);

        let mut meta = HashMap::new();
        // S3 lowercases user-metadata keys on the way back.
        meta.insert("Expires-At".to_lowercase(), expires_at.to_rfc3339());
        meta.insert(
            "Headers".to_lowercase(),
            serde_json::to_string(&headers).unwrap(),
        );

        let (decoded_expiry, decoded_headers) = decode_meta(&meta).unwrap();
        assert_eq!(decoded_expiry, expires_at);
        assert_eq!(decoded_headers, headers);
    }

    #[test]
    fn test_corrupt_meta_is_none() {
        let mut meta = HashMap::new();
        meta.insert(META_EXPIRES_AT.to_owned(), "not a time".to_owned());
        meta.insert(META_HEADERS.to_owned(), "{}".to_owned());
        assert!(decode_meta(&meta).is_none());

        assert!(decode_meta(&HashMap::new()).is_none());
    }

    #[test]
    fn test_part_size_clamped_to_minimum() {
        let config: Config = serde_json::from_str(
            r#"{ "bucket": "artifacts", "part-size-mb": 1, "concurrency": 0 }"#,
        )
        .unwrap();
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        let cache = S3Cache::with_client(Client::from_conf(conf), config);

        assert_eq!(cache.part_size, 5 * 1024 * 1024);
        assert_eq!(cache.concurrency, 1);
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_json::from_str(r#"{ "bucket": "artifacts" }"#).unwrap();

        assert_eq!(config.part_size_mb, 5);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_ttl, DEFAULT_MAX_TTL);
        assert!(config.endpoint.is_none());
        assert!(!config.force_path_style);
    }
}
