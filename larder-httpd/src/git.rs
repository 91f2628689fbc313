//! Git smart-HTTP routes.
//!
//! Requests arrive as `/git/{host}/{repo-path}/{git-request}`. A `ready`
//! mirror answers locally through `git http-backend`; a repository that is
//! still `empty` or `cloning` gets a clone job submitted and its clients
//! served from upstream, coalesced through the response spool where the
//! request shape allows it. Pushes are rejected outright.

use std::collections::HashMap;
use std::io::prelude::*;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::{io, str};

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, RawQuery, State};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use flate2::write::GzDecoder;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use url::Url;

use larder_mirror::repository::{Repositories, Repository, State as RepoState};
use larder_mirror::spool::{self, SpoolWriter};

use crate::axum_extra::stream_response;
use crate::error::Error;
use crate::Context;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/git/:host/*request", any(git_handler))
        .with_state(ctx)
}

/// The trailing component of a smart-HTTP request path.
const GIT_REQUESTS: &[&str] = &["info/refs", "git-upload-pack", "git-receive-pack"];

/// Split `{repo-path}/{git-request}`.
fn split_request(request: &str) -> Option<(&str, &str)> {
    for suffix in GIT_REQUESTS {
        if let Some(repo) = request.strip_suffix(suffix) {
            let repo = repo.trim_end_matches('/');
            if !repo.is_empty() {
                return Some((repo, suffix));
            }
        }
    }
    None
}

async fn git_handler(
    State(ctx): State<Context>,
    AxumPath((host, request)): AxumPath<(String, String)>,
    method: Method,
    headers: HeaderMap,
    query: RawQuery,
    body: Bytes,
) -> Result<Response, Error> {
    let query = query.0.unwrap_or_default();
    let (repo_path, git_request) = split_request(&request).ok_or_else(|| {
        Error::Repository(larder_mirror::repository::Error::InvalidUpstream(request.clone()))
    })?;

    // Reject push requests.
    if git_request == "git-receive-pack" || query == "service=git-receive-pack" {
        return Err(Error::ServiceUnavailable("git-receive-pack"));
    }

    let upstream = Repositories::canonical_upstream(&host, repo_path)?;
    let repo = ctx.repositories.open(&upstream);

    tracing::debug!(upstream = %upstream, request = %git_request, state = %repo.state(), "git request");

    match repo.state() {
        RepoState::Ready => serve_mirror(&ctx, &repo, method, headers, body, git_request, query).await,
        RepoState::Empty | RepoState::Cloning => {
            serve_cloning(ctx, repo, upstream, method, headers, body, git_request, query).await
        }
    }
}

/// Serve from the local mirror via `git http-backend`, keeping the mirror
/// fresh in the background.
async fn serve_mirror(
    ctx: &Context,
    repo: &Arc<Repository>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    git_request: &str,
    query: String,
) -> Result<Response, Error> {
    if git_request == "info/refs" {
        let interval = ctx.mirror.ref_check_interval;
        if let Err(err) = repo
            .ensure_refs_up_to_date(interval, ctx.scheduler.cancellation())
            .await
        {
            // The check poisoned itself and will retry; stale refs beat an
            // unserved client.
            tracing::warn!(upstream = %repo.upstream(), error = %err, "serving possibly stale refs");
        }
    }
    if repo.needs_fetch(ctx.mirror.fetch_interval) {
        let repositories = ctx.repositories.clone();
        let upstream = repo.upstream().clone();
        ctx.scheduler
            .submit(upstream.clone().as_str(), "fetch", move |token| async move {
                repositories.open(&upstream).fetch(false, &token).await?;
                Ok(())
            });
    }

    let (status, headers, body) =
        git_http_backend(repo, method, headers, body, git_request, query).await?;

    let mut response_headers = HeaderMap::new();
    for (name, values) in headers.iter() {
        for value in values {
            let name: HeaderName = name.as_str().try_into().map_err(|_| Error::Backend)?;
            response_headers.append(name, value.parse().map_err(|_| Error::Backend)?);
        }
    }
    Ok((status, response_headers, body).into_response())
}

/// Invoke `git http-backend` over the mirror and relay its CGI response.
async fn git_http_backend(
    repo: &Repository,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    path: &str,
    query: String,
) -> Result<(StatusCode, HashMap<String, Vec<String>>, Vec<u8>), Error> {
    let content_type = headers
        .get("Content-Type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let mut cmd = tokio::process::Command::new("git");
    let mut child = cmd
        .arg("http-backend")
        .env("REQUEST_METHOD", method.as_str())
        .env("GIT_PROJECT_ROOT", repo.git_dir())
        // "The GIT_HTTP_EXPORT_ALL environmental variable may be passed to
        // git-http-backend to bypass the check for the "git-daemon-export-ok"
        // file in each repository before allowing export of that repository."
        .env("GIT_HTTP_EXPORT_ALL", String::default())
        .env("PATH_INFO", Path::new("/").join(path))
        .env("CONTENT_TYPE", content_type)
        .env("QUERY_STRING", query)
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .stdin(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Whether the request body is compressed.
    let gzip = matches!(
        headers.get("Content-Encoding").map(|value| value.to_str()),
        Some(Ok("gzip"))
    );
    let payload = if gzip {
        let mut decoder = GzDecoder::new(Vec::new());
        decoder.write_all(&body)?;
        decoder.finish()?
    } else {
        body.to_vec()
    };

    {
        // This is safe because we captured the child's stdin.
        let mut stdin = child.stdin.take().expect("stdin is piped");
        stdin.write_all(&payload).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        tracing::error!("git-http-backend: exited with code {}", output.status);
        if let Ok(stderr) = str::from_utf8(&output.stderr) {
            tracing::error!("git-http-backend: stderr: {}", stderr.trim_end());
        }
        return Err(Error::Backend);
    }

    let mut reader = io::Cursor::new(output.stdout);
    let mut headers = HashMap::new();

    // Parse headers returned by git so that we can use them in the client
    // response.
    for line in io::Read::by_ref(&mut reader).lines() {
        let line = line?;

        if line.is_empty() || line == "\r" {
            break;
        }

        let mut parts = line.splitn(2, ':');
        let key = parts.next();
        let value = parts.next();

        if let (Some(key), Some(value)) = (key, value) {
            let value = &value[1..];

            headers
                .entry(key.to_string())
                .or_insert_with(Vec::new)
                .push(value.to_string());
        } else {
            return Err(Error::Backend);
        }
    }

    let status = {
        let line = headers.remove("Status").unwrap_or_default();
        let line = line.into_iter().next().unwrap_or_default();
        let mut parts = line.split(' ');

        parts
            .next()
            .and_then(|status| status.parse().ok())
            .unwrap_or(StatusCode::OK)
    };

    let position = reader.position() as usize;
    let body = reader.into_inner().split_off(position);

    Ok((status, headers, body))
}

/// Serve a repository that has no usable mirror yet: kick off the clone and
/// relay upstream, sharing one upstream response among the first wave of
/// clients where possible.
#[allow(clippy::too_many_arguments)]
async fn serve_cloning(
    ctx: Context,
    repo: Arc<Repository>,
    upstream: Url,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    git_request: &str,
    query: String,
) -> Result<Response, Error> {
    if repo.state() == RepoState::Empty {
        submit_clone(&ctx, &upstream);
    }

    let Some(key) = spool::spool_key(method.as_str(), &format!("/{git_request}"), &body) else {
        return forward_upstream(&ctx, &upstream, method, &headers, body, git_request, &query).await;
    };

    let spools = ctx.spools_for(&upstream);
    match spools.get_or_create(&key).await {
        Ok((_, Some(writer))) => {
            spool_upstream(&ctx, writer, &upstream, method, &headers, body, git_request, &query)
                .await
        }
        Ok((spool, None)) => match spool.serve().await {
            Ok(followed) => Ok(stream_response(
                StatusCode::from_u16(followed.status).unwrap_or(StatusCode::OK),
                &followed.headers,
                followed.body,
            )),
            // Nothing was captured; go to upstream ourselves.
            Err(spool::Error::Failed) | Err(spool::Error::Closed) => {
                forward_upstream(&ctx, &upstream, method, &headers, body, git_request, &query).await
            }
            Err(err) => Err(err.into()),
        },
        // The clone settled while we were routing; upstream still works.
        Err(spool::Error::Closed) => {
            forward_upstream(&ctx, &upstream, method, &headers, body, git_request, &query).await
        }
        Err(err) => Err(err.into()),
    }
}

/// Submit the clone job, keyed by upstream URL so resubmissions serialize
/// onto one queue. When the clone settles, either way, the repository's
/// spools are torn down.
fn submit_clone(ctx: &Context, upstream: &Url) {
    let repositories = ctx.repositories.clone();
    let url = upstream.clone();
    let ctx = ctx.clone();

    ctx.scheduler
        .clone()
        .submit(upstream.as_str(), "clone", move |token| async move {
            let repo = repositories.open(&url);
            let result = repo.clone_upstream(&token).await;

            // The first wave is over: new requests either hit the mirror or
            // go straight upstream.
            if let Some(spools) = ctx.take_spools(&url) {
                spools.close().await;
            }
            result.map_err(Into::into)
        });
}

fn upstream_request(
    ctx: &Context,
    upstream: &Url,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
    git_request: &str,
    query: &str,
) -> Result<reqwest::Request, Error> {
    let mut url = format!("{upstream}/{git_request}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let mut request = ctx.client.request(method, &url);
    for (name, value) in headers.iter() {
        // Credentials and capabilities pass through; Host is the upstream's.
        if name != axum::http::header::HOST {
            request = request.header(name, value);
        }
    }
    Ok(request.body(body).build()?)
}

/// Plain passthrough to upstream, for requests that must not be spooled.
async fn forward_upstream(
    ctx: &Context,
    upstream: &Url,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
    git_request: &str,
    query: &str,
) -> Result<Response, Error> {
    let request = upstream_request(ctx, upstream, method, headers, body, git_request, query)?;
    let response = ctx.client.execute(request).await?;

    let status = response.status();
    let response_headers = larder::fetch::headers_of(response.headers());
    let stream = Box::pin(futures_stream(response));

    Ok(stream_response(
        status,
        &response_headers,
        Box::new(StreamReader::new(stream)),
    ))
}

/// Relay upstream while teeing status, headers and body into the spool for
/// the followers.
#[allow(clippy::too_many_arguments)]
async fn spool_upstream(
    ctx: &Context,
    writer: SpoolWriter,
    upstream: &Url,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
    git_request: &str,
    query: &str,
) -> Result<Response, Error> {
    let request = upstream_request(ctx, upstream, method, headers, body, git_request, query)?;
    let mut response = match ctx.client.execute(request).await {
        Ok(response) => response,
        Err(err) => {
            writer.fail(&err);
            return Err(err.into());
        }
    };

    let status = response.status();
    let response_headers = larder::fetch::headers_of(response.headers());
    writer.write_header(status.as_u16(), response_headers.clone());
    // Only a captured (2xx) response gets its body spooled.
    let spooling = status.is_success();

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
    tokio::spawn(async move {
        let mut writer = Some(writer);
        let mut client = Some(tx);
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if spooling {
                        if let Some(w) = writer.as_mut() {
                            if let Err(err) = w.write(&chunk).await {
                                if let Some(w) = writer.take() {
                                    w.fail(&err);
                                }
                            }
                        }
                    }
                    if let Some(tx) = client.as_ref() {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Our client went away; keep draining upstream
                            // for the followers.
                            client = None;
                            if !spooling || writer.is_none() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    if let Some(w) = writer.take() {
                        if spooling {
                            w.complete();
                        }
                    }
                    return;
                }
                Err(err) => {
                    if let Some(w) = writer.take() {
                        w.fail(&err);
                    }
                    if let Some(tx) = client.as_ref() {
                        let _ = tx.send(Err(io::Error::other(err))).await;
                    }
                    return;
                }
            }
        }
    });

    Ok(stream_response(
        status,
        &response_headers,
        Box::new(StreamReader::new(ReceiverStream::new(rx))),
    ))
}

/// A reqwest response body as an `io::Result` byte stream.
fn futures_stream(
    response: reqwest::Response,
) -> impl futures::Stream<Item = io::Result<Bytes>> {
    use futures::StreamExt as _;

    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
}
