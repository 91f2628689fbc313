//! The remote cache object API.
//!
//! `GET`/`HEAD`/`POST`/`DELETE /api/v1/object/{hex-key}` read, probe, write
//! and drop entries of the daemon's cache; `GET /api/v1/stats` reports
//! usage. A `POST`'s headers (minus transfer noise) are cached with the
//! entry, and an optional `Time-To-Live` header bounds its lifetime using
//! the `1h30m` duration grammar.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio_stream::StreamExt as _;

use larder::headers::TIME_TO_LIVE;
use larder::Key;

use crate::axum_extra::{head_response, stream_response};
use crate::error::Error;
use crate::Context;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route(
            "/api/v1/object/:key",
            get(object_get).post(object_put).delete(object_delete),
        )
        .route("/api/v1/stats", get(stats))
        .with_state(ctx)
}

async fn object_get(
    State(ctx): State<Context>,
    method: Method,
    Path(key): Path<String>,
) -> Result<Response, Error> {
    let key: Key = key.parse()?;

    if method == Method::HEAD {
        let headers = ctx.cache.stat(&key).await?;
        Ok(head_response(&headers))
    } else {
        let (body, headers) = ctx.cache.open(&key).await?;
        Ok(stream_response(StatusCode::OK, &headers, body))
    }
}

async fn object_put(
    State(ctx): State<Context>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, Error> {
    let key: Key = key.parse()?;
    let ttl = match headers.get(TIME_TO_LIVE) {
        None => Duration::ZERO,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|value| humantime::parse_duration(value).ok())
            .ok_or_else(|| Error::TimeToLive(format!("{value:?}")))?,
    };
    let mut entry_headers = larder::fetch::headers_of(&headers);
    entry_headers.strip_transport();

    let mut writer = ctx.cache.create(&key, entry_headers, ttl).await?;
    let mut body = body.into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                writer.abort().await;
                return Err(Error::Io(std::io::Error::other(err)));
            }
        };
        if let Err(err) = writer.write(&chunk).await {
            writer.abort().await;
            return Err(err.into());
        }
    }
    writer.close().await?;

    Ok(StatusCode::OK)
}

async fn object_delete(
    State(ctx): State<Context>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let key: Key = key.parse()?;
    ctx.cache.delete(&key).await?;

    Ok(StatusCode::OK)
}

async fn stats(State(ctx): State<Context>) -> Response {
    match ctx.cache.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(larder::Error::StatsUnavailable) => StatusCode::NOT_IMPLEMENTED.into_response(),
        Err(err) => Error::from(err).into_response(),
    }
}
