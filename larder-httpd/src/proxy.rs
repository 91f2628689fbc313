//! Artifact proxy routes.
//!
//! Each configured upstream route is a thin adapter: it maps the request
//! path onto the upstream base URL, passes request headers (credentials
//! included) through unchanged, and delegates to the cache-aware fetcher.
//! Everything interesting (cache keying, the tee, non-200 passthrough)
//! lives in [`larder::fetch`].

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::axum_extra::stream_response;
use crate::error::Error;
use crate::Context;

pub fn router(ctx: Context) -> Router {
    let mut router = Router::new();
    for route in ctx.routes.iter() {
        let state = RouteState {
            ctx: ctx.clone(),
            base: route.url.trim_end_matches('/').to_owned(),
        };
        router = router.route(
            &format!("/{}/*path", route.prefix.trim_matches('/')),
            get(artifact_handler).with_state(state),
        );
    }
    router
}

#[derive(Clone)]
struct RouteState {
    ctx: Context,
    base: String,
}

async fn artifact_handler(
    State(state): State<RouteState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let mut url = format!("{}/{}", state.base, path.trim_start_matches('/'));
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }

    let mut request = state.ctx.client.get(&url);
    for (name, value) in headers.iter() {
        // The upstream gets its own Host; everything else, credentials
        // included, passes through untouched.
        if name != header::HOST {
            request = request.header(name, value);
        }
    }

    let response = larder::fetch(&state.ctx.client, request.build()?, &state.ctx.cache).await?;
    Ok(stream_response(
        response.status,
        &response.headers,
        response.body,
    ))
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use pretty_assertions::assert_eq;

    use crate::test::{self, body_of, get as get_path, request};

    /// An upstream double that counts hits and echoes the auth header.
    async fn upstream(hits: Arc<AtomicUsize>) -> std::net::SocketAddr {
        let router = Router::new().route(
            "/module/@v/v1.0.0.zip",
            get(
                |State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let auth = headers
                        .get("authorization")
                        .cloned()
                        .unwrap_or_else(|| "none".try_into().unwrap());

                    let mut response = HeaderMap::new();
                    response.insert("content-type", "application/zip".try_into().unwrap());
                    response.insert("x-saw-auth", auth);
                    (response, "module bytes")
                },
            )
            .with_state(hits),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_artifact_cache_fill_and_hit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = upstream(hits.clone()).await;

        let tmp = tempfile::tempdir().unwrap();
        let ctx = test::context_with_routes(
            tmp.path(),
            vec![crate::Route {
                prefix: "go".into(),
                url: format!("http://{addr}"),
            }],
        )
        .await;
        let app = crate::router(ctx);

        let response = request(
            &app,
            "GET",
            "/go/module/@v/v1.0.0.zip",
            &[("Authorization", "Bearer sesame")],
            vec![],
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/zip"
        );
        // Credentials passed through unchanged.
        assert_eq!(response.headers().get("x-saw-auth").unwrap(), "Bearer sesame");
        assert_eq!(body_of(response).await, b"module bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Second read is served from cache.
        let response = get_path(&app, "/go/module/@v/v1.0.0.zip").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, b"module bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_passes_through_uncached() {
        let router = Router::new().route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, "nope") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let tmp = tempfile::tempdir().unwrap();
        let ctx = test::context_with_routes(
            tmp.path(),
            vec![crate::Route {
                prefix: "dl".into(),
                url: format!("http://{addr}"),
            }],
        )
        .await;
        let app = crate::router(ctx);

        for _ in 0..2 {
            let response = get_path(&app, "/dl/missing").await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(body_of(response).await, b"nope");
        }
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test::context_with_routes(
            tmp.path(),
            vec![crate::Route {
                prefix: "dl".into(),
                url: "http://127.0.0.1:1".into(),
            }],
        )
        .await;
        let app = crate::router(ctx);

        let response = get_path(&app, "/dl/something").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
