//! File-backed response spooling.
//!
//! While a repository is still cloning, every client asking for it would
//! otherwise trigger its own upstream request. The spool coalesces that
//! first wave: exactly one caller per key is designated the writer and
//! proxies upstream, teeing status, headers and body into a spool; everyone
//! else follows the spool file, reading bytes as the writer appends them.
//! Followers always observe a prefix of what the writer wrote.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use larder::Headers;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The spool failed before any response headers were captured. The
    /// caller must retry directly against upstream.
    #[error("spool failed before headers were captured")]
    Failed,

    /// The repository's spools were already torn down.
    #[error("spools are closed")]
    Closed,

    /// I/O error on the spool file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct SpoolState {
    /// Captured response status; zero until `write_header`.
    status: u16,
    headers: Option<Headers>,
    /// Bytes appended to the spool file so far.
    written: u64,
    complete: bool,
    error: Option<String>,
}

/// A single-writer, many-reader capture of one upstream response.
pub struct Spool {
    path: PathBuf,
    state: Mutex<SpoolState>,
    wake: Notify,
    readers: WaitGroup,
}

/// The response a follower serves: the captured status and headers, and a
/// body that streams the spool file as it grows.
pub struct Followed {
    pub status: u16,
    pub headers: Headers,
    pub body: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl Spool {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(SpoolState::default()),
            wake: Notify::new(),
            readers: WaitGroup::default(),
        }
    }

    /// Wait until `check` yields a value, re-checking whenever the writer
    /// signals progress.
    async fn wait_for<T>(&self, check: impl Fn(&SpoolState) -> Option<T>) -> T {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = check(&self.state.lock().expect("spool lock is not poisoned")) {
                return value;
            }
            notified.await;
        }
    }

    fn update(&self, apply: impl FnOnce(&mut SpoolState)) {
        apply(&mut self.state.lock().expect("spool lock is not poisoned"));
        self.wake.notify_waiters();
    }

    /// Follow this spool: wait for the captured response head, then stream
    /// the body from the start of the file, keeping pace with the writer.
    ///
    /// [`Error::Failed`] means nothing was captured before the writer gave
    /// up; the caller falls back to its own upstream request.
    pub async fn serve(self: Arc<Self>) -> Result<Followed, Error> {
        let guard = self.readers.enter();

        let head = self
            .wait_for(|state| {
                if state.status != 0 {
                    Some(Ok((state.status, state.headers.clone().unwrap_or_default())))
                } else if state.error.is_some() {
                    Some(Err(Error::Failed))
                } else {
                    None
                }
            })
            .await;
        let (status, headers) = head?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        let spool = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut offset: u64 = 0;
            let mut buffer = vec![0u8; 64 * 1024];

            loop {
                let (written, complete, error) = spool
                    .wait_for(|state| {
                        if state.written > offset || state.complete || state.error.is_some() {
                            Some((state.written, state.complete, state.error.clone()))
                        } else {
                            None
                        }
                    })
                    .await;

                while offset < written {
                    let take = buffer.len().min((written - offset) as usize);
                    match file.read_exact(&mut buffer[..take]).await {
                        Ok(_) => {}
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                    offset += take as u64;
                    if tx
                        .send(Ok(Bytes::copy_from_slice(&buffer[..take])))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                if let Some(error) = error {
                    let _ = tx.send(Err(std::io::Error::other(error))).await;
                    return;
                }
                if complete && offset >= written {
                    return;
                }
            }
        });

        Ok(Followed {
            status,
            headers,
            body: Box::new(StreamReader::new(ReceiverStream::new(rx))),
        })
    }
}

/// The writer half of a spool, held by the one caller that talks to
/// upstream.
pub struct SpoolWriter {
    spool: Arc<Spool>,
    file: tokio::fs::File,
}

impl SpoolWriter {
    /// Record the upstream response head. A non-2xx status fails the spool
    /// so followers fall back to their own upstream requests.
    pub fn write_header(&self, status: u16, headers: Headers) {
        if (200..300).contains(&status) {
            self.spool.update(|state| {
                state.status = status;
                state.headers = Some(headers);
            });
        } else {
            tracing::debug!(status, "upstream response not spoolable");
            self.spool.update(|state| {
                state.error = Some(format!("upstream returned status {status}"));
            });
        }
    }

    /// Append a body chunk and wake followers.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.file.write_all(chunk).await?;
        self.file.flush().await?;
        self.spool
            .update(|state| state.written += chunk.len() as u64);

        Ok(())
    }

    /// Mark the response complete.
    pub fn complete(self) {
        self.spool.update(|state| state.complete = true);
    }

    /// Mark the spool failed; followers that already saw headers get the
    /// error, the rest fall back to upstream.
    pub fn fail(self, reason: impl ToString) {
        let reason = reason.to_string();
        tracing::warn!(error = %reason, "spool failed");
        self.spool.update(|state| {
            state.error = Some(reason);
            state.complete = true;
        });
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        // A writer that vanishes without completing must not strand its
        // followers.
        self.spool.update(|state| {
            if !state.complete && state.error.is_none() {
                state.error = Some("spool writer abandoned the response".to_owned());
                state.complete = true;
            }
        });
    }
}

/// The spools of one repository, keyed by [`spool_key`] value.
pub struct RepoSpools {
    dir: PathBuf,
    spools: Mutex<Option<HashMap<String, Arc<Spool>>>>,
}

impl RepoSpools {
    /// Spools live under `dir`; it is created lazily and removed by
    /// [`RepoSpools::close`].
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            spools: Mutex::new(Some(HashMap::new())),
        }
    }

    /// The spool under `key`, plus whether the caller was designated its
    /// writer. Exactly one caller per key is.
    pub async fn get_or_create(&self, key: &str) -> Result<(Arc<Spool>, Option<SpoolWriter>), Error> {
        let (spool, is_writer) = {
            let mut spools = self.spools.lock().expect("spool map lock is not poisoned");
            let spools = spools.as_mut().ok_or(Error::Closed)?;
            match spools.get(key) {
                Some(spool) => (spool.clone(), false),
                None => {
                    let spool = Arc::new(Spool::new(self.dir.join(key)));
                    spools.insert(key.to_owned(), spool.clone());
                    (spool, true)
                }
            }
        };

        if !is_writer {
            return Ok((spool, None));
        }

        // The writer brings the file into existence before any follower can
        // observe headers, so followers always find it.
        tokio::fs::create_dir_all(&self.dir).await?;
        match tokio::fs::File::create(&spool.path).await {
            Ok(file) => Ok((spool.clone(), Some(SpoolWriter { spool, file }))),
            Err(err) => {
                spool.update(|state| {
                    state.error = Some(format!("failed to create spool file: {err}"));
                });
                Err(err.into())
            }
        }
    }

    /// Tear down: refuse new spools, wait until every follower has finished
    /// reading, then remove the spool directory.
    pub async fn close(&self) {
        let spools = {
            let mut spools = self.spools.lock().expect("spool map lock is not poisoned");
            spools.take().unwrap_or_default()
        };
        for spool in spools.values() {
            spool.readers.wait().await;
        }
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), error = %err, "failed to remove spool directory");
            }
        }
    }
}

/// The spool key of a request, or `None` when the request must not be
/// spooled.
///
/// Only `git-upload-pack` coalesces. `GET`s share one key; `POST`s (protocol
/// v2 multiplexes sub-commands over one URL) are keyed by a hash of the
/// request body, which the caller has buffered and will replay downstream.
pub fn spool_key(method: &str, path: &str, body: &[u8]) -> Option<String> {
    if !path.trim_end_matches('/').ends_with("git-upload-pack") {
        return None;
    }
    match method {
        "GET" => Some("upload-pack".to_owned()),
        "POST" => {
            let digest = Sha256::digest(body);
            Some(format!("upload-pack-{}", hex::encode(&digest[..8])))
        }
        _ => None,
    }
}

/// Counts active readers and lets `close` wait for them to drain.
#[derive(Default)]
struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: Mutex<usize>,
    zero: Notify,
}

struct WaitGuard(Arc<WaitGroupInner>);

impl WaitGroup {
    fn enter(&self) -> WaitGuard {
        *self.inner.count.lock().expect("wait group lock is not poisoned") += 1;
        WaitGuard(self.inner.clone())
    }

    async fn wait(&self) {
        loop {
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *self.inner.count.lock().expect("wait group lock is not poisoned") == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().expect("wait group lock is not poisoned");
        *count -= 1;
        if *count == 0 {
            self.0.zero.notify_waiters();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::io::AsyncReadExt as _;

    use super::*;

    async fn read_all(mut body: Box<dyn tokio::io::AsyncRead + Send + Unpin>) -> Vec<u8> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn headers() -> Headers {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/x-git-upload-pack-result");
        headers
    }

    /// A slow writer and five followers started at arbitrary points: every
    /// follower sees the captured status and exactly the writer's bytes.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_fan_out() {
        let tmp = tempfile::tempdir().unwrap();
        let spools = Arc::new(RepoSpools::new(tmp.path().join("spools")));

        let (spool, writer) = spools.get_or_create("upload-pack").await.unwrap();
        let mut writer = writer.expect("first caller is the writer");

        let mut followers = Vec::new();
        let spawn_follower = |spool: Arc<Spool>| {
            tokio::spawn(async move {
                let followed = spool.serve().await.unwrap();
                (followed.status, followed.headers, read_all(followed.body).await)
            })
        };

        // Two followers before any headers exist.
        followers.push(spawn_follower(spool.clone()));
        followers.push(spawn_follower(spool.clone()));

        writer.write_header(200, headers());
        tokio::time::sleep(Duration::from_millis(20)).await;
        followers.push(spawn_follower(spool.clone()));

        for chunk in [&b"0123456789"[..], b"abcdefghij", b"ABCDEFGHIJ"] {
            writer.write(chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            followers.push(spawn_follower(spool.clone()));
        }
        writer.complete();

        for follower in followers {
            let (status, got_headers, body) = follower.await.unwrap();
            assert_eq!(status, 200);
            assert_eq!(got_headers, headers());
            assert_eq!(body, b"0123456789abcdefghijABCDEFGHIJ");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_followers_share_one_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let spools = RepoSpools::new(tmp.path().join("spools"));

        let (_, writer) = spools.get_or_create("upload-pack").await.unwrap();
        assert!(writer.is_some());

        for _ in 0..3 {
            let (_, writer) = spools.get_or_create("upload-pack").await.unwrap();
            assert!(writer.is_none());
        }

        // A different key gets its own writer.
        let (_, writer) = spools.get_or_create("upload-pack-0011223344556677").await.unwrap();
        assert!(writer.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_before_headers_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let spools = RepoSpools::new(tmp.path().join("spools"));

        let (spool, writer) = spools.get_or_create("upload-pack").await.unwrap();
        let writer = writer.unwrap();

        let follower = {
            let spool = spool.clone();
            tokio::spawn(async move { spool.serve().await.map(|_| ()) })
        };

        // Upstream said 502: nothing was captured, followers must go direct.
        writer.write_header(502, Headers::new());
        assert!(matches!(follower.await.unwrap(), Err(Error::Failed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_mid_body_surfaces_to_followers() {
        let tmp = tempfile::tempdir().unwrap();
        let spools = RepoSpools::new(tmp.path().join("spools"));

        let (spool, writer) = spools.get_or_create("upload-pack").await.unwrap();
        let mut writer = writer.unwrap();
        writer.write_header(200, headers());
        writer.write(b"partial").await.unwrap();

        let follower = {
            let spool = spool.clone();
            tokio::spawn(async move {
                let followed = spool.serve().await.unwrap();
                let mut body = followed.body;
                let mut buf = Vec::new();
                body.read_to_end(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.fail("connection reset");

        assert!(follower.await.unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_waits_for_readers() {
        let tmp = tempfile::tempdir().unwrap();
        let spools = Arc::new(RepoSpools::new(tmp.path().join("spools")));

        let (spool, writer) = spools.get_or_create("upload-pack").await.unwrap();
        let mut writer = writer.unwrap();
        writer.write_header(200, headers());
        writer.write(b"0123456789").await.unwrap();

        let follower = {
            let spool = spool.clone();
            tokio::spawn(async move {
                let followed = spool.serve().await.unwrap();
                read_all(followed.body).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closed = Arc::new(AtomicBool::new(false));
        let closer = {
            let spools = spools.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                spools.close().await;
                closed.store(true, Ordering::SeqCst);
            })
        };

        // The reader is still mid-stream: close must not have finished.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!closed.load(Ordering::SeqCst));

        writer.complete();
        assert_eq!(follower.await.unwrap(), b"0123456789");
        closer.await.unwrap();
        assert!(closed.load(Ordering::SeqCst));

        // Closed spools refuse new work, and the directory is gone.
        assert!(matches!(
            spools.get_or_create("upload-pack").await,
            Err(Error::Closed)
        ));
        assert!(!tmp.path().join("spools").exists());
    }

    #[test]
    fn test_spool_key_selection() {
        // Only upload-pack requests coalesce.
        assert_eq!(
            spool_key("GET", "/github.com/a/b/git-upload-pack", b""),
            Some("upload-pack".to_owned())
        );
        assert_eq!(spool_key("GET", "/github.com/a/b/info/refs", b""), None);
        assert_eq!(
            spool_key("POST", "/github.com/a/b/git-receive-pack", b""),
            None
        );

        // POST keys depend on the body, so protocol-v2 sub-commands sharing
        // one URL spool separately.
        let fetch = spool_key("POST", "/h/a/b/git-upload-pack", b"0014command=fetch").unwrap();
        let ls = spool_key("POST", "/h/a/b/git-upload-pack", b"0014command=ls-refs").unwrap();
        assert_ne!(fetch, ls);
        assert!(fetch.starts_with("upload-pack-"));
        assert_eq!(fetch.len(), "upload-pack-".len() + 16);
        assert_eq!(
            spool_key("POST", "/h/a/b/git-upload-pack", b"0014command=fetch").unwrap(),
            fetch
        );
    }

    /// Random follower start offsets against a random chunk schedule: all
    /// outputs are identical to the writer's byte sequence.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefix_consistency() {
        fastrand::seed(0x5b001);
        let tmp = tempfile::tempdir().unwrap();
        let spools = RepoSpools::new(tmp.path().join("spools"));

        let (spool, writer) = spools.get_or_create("upload-pack").await.unwrap();
        let mut writer = writer.unwrap();
        writer.write_header(200, Headers::new());

        let mut followers = Vec::new();
        for _ in 0..4 {
            let spool = spool.clone();
            followers.push(tokio::spawn(async move {
                let followed = spool.serve().await.unwrap();
                read_all(followed.body).await
            }));
        }

        let mut expected = Vec::new();
        for i in 0..20u8 {
            let chunk = vec![i; 1 + fastrand::usize(..2048)];
            writer.write(&chunk).await.unwrap();
            expected.extend_from_slice(&chunk);
            if fastrand::bool() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        writer.complete();

        for follower in followers {
            assert_eq!(follower.await.unwrap(), expected);
        }
    }
}
