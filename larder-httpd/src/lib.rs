#![cfg_attr(not(test), warn(clippy::unwrap_used))]
pub mod error;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use std::str;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use axum::Router;
use tower_http::trace::TraceLayer;
use url::Url;

use larder::cache::Cache;
use larder_job::Scheduler;
use larder_mirror::spool::RepoSpools;
use larder_mirror::Repositories;

mod api;
mod axum_extra;
mod config;
mod git;
mod proxy;

pub use config::{CacheConfig, Config, MirrorConfig, Route};

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    pub config: PathBuf,
}

/// Shared state of every route.
#[derive(Clone)]
pub struct Context {
    cache: Arc<dyn Cache>,
    client: reqwest::Client,
    repositories: Arc<Repositories>,
    scheduler: Scheduler,
    /// Spools of repositories that are still cloning, keyed by upstream URL.
    spools: Arc<Mutex<HashMap<String, Arc<RepoSpools>>>>,
    spool_root: PathBuf,
    mirror: MirrorConfig,
    routes: Arc<[Route]>,
}

impl Context {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let cache = larder::cache::instantiate(&config.cache.backend, config.cache.config)
            .await
            .context("failed to construct the cache backend")?;

        let repositories = Arc::new(Repositories::new(config.mirror.root.clone()));
        repositories
            .discover()
            .context("failed to discover mirrored repositories")?;

        let scheduler = Scheduler::new(larder_job::Config {
            concurrency: config.concurrency,
        });
        let client = reqwest::Client::builder()
            .build()
            .context("failed to construct the upstream HTTP client")?;

        Ok(Self {
            cache: Arc::from(cache),
            client,
            repositories,
            scheduler,
            spools: Arc::new(Mutex::new(HashMap::new())),
            spool_root: config.mirror.root.join(".spools"),
            mirror: config.mirror,
            routes: config.upstreams.into(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The spool collection of the given upstream, created on first use.
    fn spools_for(&self, upstream: &Url) -> Arc<RepoSpools> {
        let mut spools = self.spools.lock().expect("spool map lock is not poisoned");
        spools
            .entry(upstream.as_str().to_owned())
            .or_insert_with(|| {
                let dir = self
                    .spool_root
                    .join(larder::Key::of(upstream.as_str()).to_string());
                Arc::new(RepoSpools::new(dir))
            })
            .clone()
    }

    /// Remove and return the spool collection of the given upstream, if any.
    fn take_spools(&self, upstream: &Url) -> Option<Arc<RepoSpools>> {
        self.spools
            .lock()
            .expect("spool map lock is not poisoned")
            .remove(upstream.as_str())
    }
}

/// Run the server.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let git_version = Command::new("git")
        .arg("version")
        .output()
        .context("'git' command must be available")?
        .stdout;
    tracing::info!("{}", str::from_utf8(&git_version)?.trim());

    let config = Config::load(&options.config)
        .with_context(|| format!("failed to load {}", options.config.display()))?;
    let ctx = Context::new(config).await?;

    // Keep every known mirror fresh in the background; request-driven
    // fetches share the same per-repository queue.
    for repo in ctx.repositories.iter() {
        let repositories = ctx.repositories.clone();
        let upstream = repo.upstream().clone();
        ctx.scheduler.submit_periodic(
            upstream.clone().as_str(),
            "refresh",
            ctx.mirror.fetch_interval,
            move |token| {
                let repositories = repositories.clone();
                let upstream = upstream.clone();
                async move {
                    repositories.open(&upstream).fetch(false, &token).await?;
                    Ok(())
                }
            },
        );
    }

    let app = router(ctx.clone())
        .layer(TraceLayer::new_for_http())
        .into_make_service();

    let listener = tokio::net::TcpListener::bind(options.listen).await?;
    tracing::info!("listening on http://{}", options.listen);

    let scheduler = ctx.scheduler.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            scheduler.shutdown();
        })
        .await
        .map_err(anyhow::Error::from)
}

/// Create a router consisting of the object API, the Git smart-HTTP routes
/// and the artifact proxy routes.
fn router(ctx: Context) -> Router {
    Router::new()
        .merge(api::router(ctx.clone()))
        .merge(git::router(ctx.clone()))
        .merge(proxy::router(ctx))
}

pub mod logger {
    use tracing_subscriber::EnvFilter;

    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
    }
}

#[cfg(test)]
mod routes {
    use axum::http::StatusCode;

    use crate::test;

    #[tokio::test]
    async fn test_invalid_route_returns_404() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test::context(tmp.path()).await;
        let app = super::router(ctx);

        let response = test::get(&app, "/no/such/route").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
