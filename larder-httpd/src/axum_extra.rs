use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse as _, Response};
use tokio_util::io::ReaderStream;

use larder::Headers;

/// Build a streaming response from a status, entry headers and a body
/// stream.
pub fn stream_response(status: StatusCode, headers: &Headers, body: larder::cache::Stream) -> Response {
    let mut response = Response::builder().status(status);
    if let Some(map) = response.headers_mut() {
        *map = larder::fetch::header_map(headers);
    }
    response
        .body(Body::from_stream(ReaderStream::new(body)))
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to build response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// An empty-bodied response carrying entry headers, for `HEAD`.
pub fn head_response(headers: &Headers) -> Response {
    stream_response(StatusCode::OK, headers, Box::new(tokio::io::empty()))
}
