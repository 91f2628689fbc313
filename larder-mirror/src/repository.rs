//! Repository lifecycle management.
//!
//! Every mirrored repository moves through `empty → cloning → ready`; once
//! ready it stays ready for the process lifetime, with fetches mutating data
//! but not state. The mirror is a normal (non-bare) clone at
//! `{root}/{host}/{path}`, and the presence of `.git/HEAD` under that path
//! proves a valid clone across restarts.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A git subprocess exited unsuccessfully.
    #[error("'git {command}' exited with code {code}: {stderr}")]
    Git {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The upstream location does not form a valid URL.
    #[error("invalid upstream '{0}'")]
    InvalidUpstream(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Clone state of a repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No clone on disk.
    Empty,
    /// A clone subprocess is running.
    Cloning,
    /// A valid clone is on disk.
    Ready,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Cloning => write!(f, "cloning"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

#[derive(Debug)]
struct Meta {
    state: State,
    last_fetch: Option<Instant>,
    last_ref_check: Option<Instant>,
    ref_check_valid: bool,
}

/// A mirrored repository. Shared; identified by its upstream URL.
pub struct Repository {
    upstream: Url,
    path: PathBuf,
    meta: RwLock<Meta>,
    /// Serializes fetches: one in flight per repository.
    fetch_lock: Semaphore,
}

impl Repository {
    fn new(upstream: Url, path: PathBuf, state: State) -> Self {
        Self {
            upstream,
            path,
            meta: RwLock::new(Meta {
                state,
                last_fetch: None,
                last_ref_check: None,
                ref_check_valid: false,
            }),
            fetch_lock: Semaphore::new(1),
        }
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// The mirror's working copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git_dir(&self) -> PathBuf {
        self.path.join(".git")
    }

    /// Current clone state. Never blocks on in-flight clones or fetches.
    pub fn state(&self) -> State {
        self.meta.read().expect("repository lock is not poisoned").state
    }

    /// Whether the last fetch is at least `interval` old.
    pub fn needs_fetch(&self, interval: Duration) -> bool {
        let meta = self.meta.read().expect("repository lock is not poisoned");
        match meta.last_fetch {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    /// Clone the repository from upstream.
    ///
    /// Coalesces: if the repository is already cloning or ready, this
    /// returns without running anything. On failure the repository returns
    /// to `empty`, eligible for a fresh attempt.
    pub async fn clone_upstream(&self, token: &CancellationToken) -> Result<(), Error> {
        // The lock is held for the transition only, never across the
        // subprocess, so `state()` stays responsive during long clones.
        {
            let mut meta = self.meta.write().expect("repository lock is not poisoned");
            match meta.state {
                State::Empty => meta.state = State::Cloning,
                State::Cloning | State::Ready => return Ok(()),
            }
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(upstream = %self.upstream, path = %self.path.display(), "cloning repository");
        let result = git(
            None,
            &[
                "clone",
                self.upstream.as_str(),
                &self.path.to_string_lossy(),
            ],
            token,
        )
        .await;

        let mut meta = self.meta.write().expect("repository lock is not poisoned");
        match result {
            Ok(_) => {
                meta.state = State::Ready;
                meta.last_fetch = Some(Instant::now());
                tracing::info!(upstream = %self.upstream, "clone finished");
                Ok(())
            }
            Err(err) => {
                meta.state = State::Empty;
                tracing::error!(upstream = %self.upstream, error = %err, "clone failed");
                Err(err)
            }
        }
    }

    /// Fetch from upstream. Returns `true` if this call performed the fetch.
    ///
    /// At most one fetch runs per repository. When one is already in flight,
    /// `wait` decides whether to block until it finishes and then return
    /// without re-fetching, since that fetch subsumes this one, or to
    /// return right away.
    pub async fn fetch(&self, wait: bool, token: &CancellationToken) -> Result<bool, Error> {
        let _permit = match self.fetch_lock.try_acquire() {
            Ok(permit) => permit,
            Err(_) if !wait => return Ok(false),
            Err(_) => {
                let permit = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    permit = self.fetch_lock.acquire() => permit,
                };
                // The in-flight fetch finished while we waited; it subsumes
                // this one.
                drop(permit);
                return Ok(false);
            }
        };

        tracing::debug!(upstream = %self.upstream, "fetching repository");
        git(Some(&self.path), &["fetch", "--prune", "origin"], token).await?;

        let mut meta = self.meta.write().expect("repository lock is not poisoned");
        meta.last_fetch = Some(Instant::now());

        Ok(true)
    }

    /// Make sure the local refs match upstream, checking at most once per
    /// `interval`.
    ///
    /// Called on ref discovery requests. Compares upstream `refs/heads/*`
    /// against the local remote-tracking refs and fetches on any mismatch. A
    /// failed fetch poisons the check so the next request retries.
    pub async fn ensure_refs_up_to_date(
        &self,
        interval: Duration,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        {
            let meta = self.meta.read().expect("repository lock is not poisoned");
            let recent = meta
                .last_ref_check
                .map(|at| at.elapsed() < interval)
                .unwrap_or(false);
            if meta.ref_check_valid && recent {
                return Ok(());
            }
        }
        {
            // Tentatively valid; rolled back below if the check fails.
            let mut meta = self.meta.write().expect("repository lock is not poisoned");
            meta.last_ref_check = Some(Instant::now());
            meta.ref_check_valid = true;
        }

        let result = self.check_refs(token).await;
        if let Err(err) = &result {
            let mut meta = self.meta.write().expect("repository lock is not poisoned");
            meta.ref_check_valid = false;
            tracing::warn!(upstream = %self.upstream, error = %err, "ref freshness check failed");
        }
        result
    }

    async fn check_refs(&self, token: &CancellationToken) -> Result<(), Error> {
        let local = self.local_refs(token).await?;
        let upstream = self.upstream_refs(token).await?;

        let stale = upstream.iter().any(|(name, sha)| {
            local.get(&format!("refs/remotes/origin/{name}")) != Some(sha)
        });
        if stale {
            tracing::debug!(upstream = %self.upstream, "local refs are stale, fetching");
            self.fetch(true, token).await?;
        }
        Ok(())
    }

    /// Local remote-tracking refs, full name → SHA.
    async fn local_refs(
        &self,
        token: &CancellationToken,
    ) -> Result<HashMap<String, String>, Error> {
        let output = git(
            Some(&self.path),
            &[
                "for-each-ref",
                "--format=%(objectname) %(refname)",
                "refs/remotes/origin",
            ],
            token,
        )
        .await?;

        Ok(output
            .lines()
            .filter_map(|line| {
                let (sha, name) = line.split_once(' ')?;
                Some((name.to_owned(), sha.to_owned()))
            })
            .collect())
    }

    /// Upstream heads, short name → SHA. Peeled-tag entries (`^{}`) are
    /// ignored.
    async fn upstream_refs(
        &self,
        token: &CancellationToken,
    ) -> Result<HashMap<String, String>, Error> {
        let output = git(
            None,
            &["ls-remote", "--heads", self.upstream.as_str()],
            token,
        )
        .await?;

        Ok(output
            .lines()
            .filter_map(|line| {
                let (sha, name) = line.split_once('\t')?;
                if name.ends_with("^{}") {
                    return None;
                }
                let name = name.strip_prefix("refs/heads/")?;
                Some((name.to_owned(), sha.to_owned()))
            })
            .collect())
    }
}

/// The process-wide repository map.
pub struct Repositories {
    root: PathBuf,
    repos: RwLock<HashMap<String, Arc<Repository>>>,
}

impl Repositories {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            repos: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The canonical upstream URL of a mirror request: HTTPS, no trailing
    /// slash, `.git` suffix stripped.
    pub fn canonical_upstream(host: &str, path: &str) -> Result<Url, Error> {
        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        if host.is_empty() || path.is_empty() {
            return Err(Error::InvalidUpstream(format!("{host}/{path}")));
        }
        Url::parse(&format!("https://{host}/{path}"))
            .map_err(|_| Error::InvalidUpstream(format!("{host}/{path}")))
    }

    /// The repository mirroring `upstream`, registering it if new. A fresh
    /// registration is `ready` iff a valid clone is already on disk.
    pub fn open(&self, upstream: &Url) -> Arc<Repository> {
        let key = upstream.as_str().to_owned();
        {
            let repos = self.repos.read().expect("repository map lock is not poisoned");
            if let Some(repo) = repos.get(&key) {
                return repo.clone();
            }
        }

        let mut repos = self.repos.write().expect("repository map lock is not poisoned");
        repos
            .entry(key)
            .or_insert_with(|| {
                let path = self.mirror_path(upstream);
                let state = if path.join(".git").join("HEAD").exists() {
                    State::Ready
                } else {
                    State::Empty
                };
                Arc::new(Repository::new(upstream.clone(), path, state))
            })
            .clone()
    }

    /// All currently registered repositories.
    pub fn iter(&self) -> Vec<Arc<Repository>> {
        self.repos
            .read()
            .expect("repository map lock is not poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Walk the mirror root and register every directory holding a
    /// `.git/HEAD` as a ready repository, reconstructing its upstream as
    /// `https://{host}/{path}`. Returns how many were found.
    pub fn discover(&self) -> Result<usize, Error> {
        let mut found = 0;
        if !self.root.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let host = entry.file_name().to_string_lossy().into_owned();
            if host.starts_with('.') {
                continue;
            }
            found += self.discover_in(&host, &entry.path(), &mut Vec::new())?;
        }
        tracing::info!(count = found, root = %self.root.display(), "discovered mirrored repositories");

        Ok(found)
    }

    fn discover_in(
        &self,
        host: &str,
        dir: &Path,
        segments: &mut Vec<String>,
    ) -> Result<usize, Error> {
        if dir.join(".git").join("HEAD").exists() {
            let path = segments.join("/");
            match Self::canonical_upstream(host, &path) {
                Ok(upstream) => {
                    self.open(&upstream);
                    tracing::debug!(upstream = %upstream, "registered mirror");
                    return Ok(1);
                }
                Err(err) => {
                    tracing::warn!(host = %host, path = %path, error = %err, "skipping unrecognizable mirror");
                    return Ok(0);
                }
            }
        }

        let mut found = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_dir() || name == ".git" {
                continue;
            }
            segments.push(name);
            found += self.discover_in(host, &entry.path(), segments)?;
            segments.pop();
        }
        Ok(found)
    }

    fn mirror_path(&self, upstream: &Url) -> PathBuf {
        let mut path = self.root.clone();
        if let Some(host) = upstream.host_str() {
            path.push(host);
        }
        for segment in upstream.path().trim_matches('/').split('/') {
            if !segment.is_empty() {
                path.push(segment);
            }
        }
        path
    }
}

/// Run a git subprocess, returning its stdout. Cancellation kills the
/// subprocess.
async fn git(dir: Option<&Path>, args: &[&str], token: &CancellationToken) -> Result<String, Error> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let child = cmd
        .args(args)
        // A daemon must never sit on a credential prompt.
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        output = child.wait_with_output() => output?,
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::Git {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn run(dir: &Path, args: &[&str]) {
        let output = std::process::Command::new("git")
            .current_dir(dir)
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@localhost",
                "-c",
                "protocol.file.allow=always",
            ])
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// A local upstream repository with one commit, addressed by `file://`.
    fn upstream(dir: &Path) -> Url {
        let origin = dir.join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        run(&origin, &["init", "-b", "master"]);
        std::fs::write(origin.join("README"), "hello\n").unwrap();
        run(&origin, &["add", "."]);
        run(&origin, &["commit", "-m", "Initial commit"]);

        Url::from_file_path(&origin).unwrap()
    }

    fn commit(origin: &Path, name: &str) {
        std::fs::write(origin.join(name), name).unwrap();
        run(origin, &["add", "."]);
        run(origin, &["commit", "-m", name]);
    }

    /// Clones through `file://` need the file transport enabled; recent git
    /// locks it down by default.
    fn allow_file_protocol() {
        std::env::set_var("GIT_ALLOW_PROTOCOL", "file");
    }

    #[tokio::test]
    async fn test_clone_lifecycle() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = upstream(tmp.path());
        let repos = Repositories::new(tmp.path().join("mirrors"));
        let token = CancellationToken::new();

        let repo = repos.open(&url);
        assert_eq!(repo.state(), State::Empty);

        repo.clone_upstream(&token).await.unwrap();
        assert_eq!(repo.state(), State::Ready);
        assert!(repo.git_dir().join("HEAD").exists());

        // Re-entry coalesces: no second subprocess, state stays ready.
        repo.clone_upstream(&token).await.unwrap();
        assert_eq!(repo.state(), State::Ready);
    }

    #[tokio::test]
    async fn test_clone_failure_resets_to_empty() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(tmp.path().join("does-not-exist")).unwrap();
        let repos = Repositories::new(tmp.path().join("mirrors"));
        let token = CancellationToken::new();

        let repo = repos.open(&url);
        assert!(repo.clone_upstream(&token).await.is_err());
        assert_eq!(repo.state(), State::Empty);
    }

    #[tokio::test]
    async fn test_state_is_observable_during_clone() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = upstream(tmp.path());
        let repos = Repositories::new(tmp.path().join("mirrors"));
        let repo = repos.open(&url);

        // Flip to cloning by hand and make sure `state()` answers without
        // blocking on anything.
        repo.meta.write().unwrap().state = State::Cloning;
        assert_eq!(repo.state(), State::Cloning);
        repo.meta.write().unwrap().state = State::Empty;

        repo.clone_upstream(&CancellationToken::new()).await.unwrap();
        assert_eq!(repo.state(), State::Ready);
    }

    /// Two clone submissions on one queue: the first clones, the second
    /// observes `ready` and coalesces.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_clone_jobs_coalesce() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = upstream(tmp.path());
        let repos = Arc::new(Repositories::new(tmp.path().join("mirrors")));
        let repo = repos.open(&url);

        let scheduler = larder_job::Scheduler::new(larder_job::Config::default());
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let repo = repo.clone();
            let runs = runs.clone();
            scheduler.submit(url.as_str(), "clone", move |token| async move {
                if repo.state() == State::Empty {
                    runs.fetch_add(1, Ordering::SeqCst);
                    repo.clone_upstream(&token).await?;
                }
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(repo.state(), State::Ready);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_needs_fetch() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = upstream(tmp.path());
        let repos = Repositories::new(tmp.path().join("mirrors"));
        let repo = repos.open(&url);
        let token = CancellationToken::new();

        assert!(repo.needs_fetch(Duration::from_secs(3600)));
        repo.clone_upstream(&token).await.unwrap();
        assert!(!repo.needs_fetch(Duration::from_secs(3600)));
        assert!(repo.needs_fetch(Duration::ZERO));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_fetches_coalesce() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = upstream(tmp.path());
        let repos = Repositories::new(tmp.path().join("mirrors"));
        let repo = repos.open(&url);
        let token = CancellationToken::new();
        repo.clone_upstream(&token).await.unwrap();

        let (a, b) = tokio::join!(repo.fetch(true, &token), repo.fetch(true, &token));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one caller performs the fetch");

        // Non-waiting callers bounce off an in-flight fetch.
        let _held = repo.fetch_lock.try_acquire().unwrap();
        assert!(!repo.fetch(false, &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_ref_freshness() {
        allow_file_protocol();
        let tmp = tempfile::tempdir().unwrap();
        let url = upstream(tmp.path());
        let origin = tmp.path().join("origin");
        let repos = Repositories::new(tmp.path().join("mirrors"));
        let repo = repos.open(&url);
        let token = CancellationToken::new();
        repo.clone_upstream(&token).await.unwrap();

        // Fresh clone: refs match, no fetch needed.
        repo.ensure_refs_up_to_date(Duration::ZERO, &token)
            .await
            .unwrap();
        let before = repo.local_refs(&token).await.unwrap();

        // Upstream moves. Within the check interval nothing happens...
        commit(&origin, "second");
        repo.ensure_refs_up_to_date(Duration::from_secs(3600), &token)
            .await
            .unwrap();
        assert_eq!(repo.local_refs(&token).await.unwrap(), before);

        // ...and once the interval lapses, the mismatch triggers a fetch.
        repo.ensure_refs_up_to_date(Duration::ZERO, &token)
            .await
            .unwrap();
        let after = repo.local_refs(&token).await.unwrap();
        assert_ne!(after, before);

        let heads = repo.upstream_refs(&token).await.unwrap();
        assert_eq!(
            after.get("refs/remotes/origin/master"),
            heads.get("master")
        );
    }

    #[tokio::test]
    async fn test_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("mirrors");

        // A plausible mirror tree; only directories with .git/HEAD count.
        std::fs::create_dir_all(root.join("github.com/acme/tool/.git")).unwrap();
        std::fs::write(root.join("github.com/acme/tool/.git/HEAD"), "ref:\n").unwrap();
        std::fs::create_dir_all(root.join("gitlab.com/group/sub/repo/.git")).unwrap();
        std::fs::write(root.join("gitlab.com/group/sub/repo/.git/HEAD"), "ref:\n").unwrap();
        std::fs::create_dir_all(root.join("github.com/acme/incomplete")).unwrap();

        let repos = Repositories::new(root);
        assert_eq!(repos.discover().unwrap(), 2);

        let upstreams: Vec<String> = repos
            .iter()
            .iter()
            .map(|r| r.upstream().to_string())
            .collect();
        assert!(upstreams.contains(&"https://github.com/acme/tool".to_string()));
        assert!(upstreams.contains(&"https://gitlab.com/group/sub/repo".to_string()));
        for repo in repos.iter() {
            assert_eq!(repo.state(), State::Ready);
        }
    }

    #[test]
    fn test_canonical_upstream() {
        let url = Repositories::canonical_upstream("github.com", "/acme/tool.git/").unwrap();
        assert_eq!(url.as_str(), "https://github.com/acme/tool");

        let url = Repositories::canonical_upstream("github.com", "acme/tool").unwrap();
        assert_eq!(url.as_str(), "https://github.com/acme/tool");

        assert!(Repositories::canonical_upstream("", "acme/tool").is_err());
        assert!(Repositories::canonical_upstream("github.com", "").is_err());
    }

    #[test]
    fn test_mirror_path_mirrors_upstream_layout() {
        let repos = Repositories::new(PathBuf::from("/var/mirrors"));
        let url = Url::parse("https://github.com/acme/tool").unwrap();

        assert_eq!(
            repos.mirror_path(&url),
            PathBuf::from("/var/mirrors/github.com/acme/tool")
        );
    }
}
