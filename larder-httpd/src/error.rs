use axum::http;
use axum::response::{IntoResponse, Response};

/// Errors relating to the HTTP daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The service is not available.
    #[error("service '{0}' not available")]
    ServiceUnavailable(&'static str),

    /// Cache error.
    #[error(transparent)]
    Cache(#[from] larder::Error),

    /// Fetch pipeline error.
    #[error(transparent)]
    Fetch(#[from] larder::fetch::Error),

    /// Repository error.
    #[error(transparent)]
    Repository(#[from] larder_mirror::repository::Error),

    /// Spool error.
    #[error(transparent)]
    Spool(#[from] larder_mirror::spool::Error),

    /// Invalid object key.
    #[error("invalid object key: {0}")]
    Key(#[from] larder::key::KeyError),

    /// Invalid `Time-To-Live` header.
    #[error("invalid time-to-live: {0}")]
    TimeToLive(String),

    /// The upstream request could not be relayed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Git backend error.
    #[error("backend error")]
    Backend,
}

impl Error {
    pub fn status(&self) -> http::StatusCode {
        match self {
            Error::Cache(larder::Error::NotFound) => http::StatusCode::NOT_FOUND,
            Error::Fetch(larder::fetch::Error::Upstream(_)) => http::StatusCode::BAD_GATEWAY,
            Error::Upstream(_) => http::StatusCode::BAD_GATEWAY,
            Error::Key(_) | Error::TimeToLive(_) => http::StatusCode::BAD_REQUEST,
            Error::Repository(larder_mirror::repository::Error::InvalidUpstream(_)) => {
                http::StatusCode::NOT_FOUND
            }
            Error::ServiceUnavailable(_) => http::StatusCode::SERVICE_UNAVAILABLE,
            _ => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::debug!("{}", self);
        }
        status.into_response()
    }
}
