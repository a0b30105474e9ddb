use std::net::SocketAddr;

use hyper::StatusCode;

#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum ProxyCacheError {
    Io(std::io::Error),
    Hyper(hyper::Error),
    HyperUtil(hyper_util::client::legacy::Error),
    Http(hyper::http::Error),
    Dns(hickory_proto::error::ProtoError),
    /// No upstream is configured for the requested path.
    NotFound,
    /// Upstream answered with a status that is not acceptable in this context.
    UpstreamStatus(StatusCode),
    Resolve {
        host: String,
        server: SocketAddr,
        reason: String,
    },
    ShortRead {
        expected: u64,
        received: u64,
    },
}

impl ProxyCacheError {
    /// HTTP status used when this error is reported before any response byte was sent.
    #[must_use]
    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UpstreamStatus(code)
                if code.is_client_error() || code.is_server_error() =>
            {
                *code
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error carries its own HTTP status and is reported in the
    /// `HTTP <code> <reason>` form rather than by its message.
    #[must_use]
    pub(crate) fn is_http_shaped(&self) -> bool {
        matches!(self, Self::NotFound | Self::UpstreamStatus(_))
    }
}

impl std::fmt::Display for ProxyCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Hyper(e) => e.fmt(f),
            Self::HyperUtil(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::Dns(e) => e.fmt(f),
            Self::NotFound => write!(f, "HTTP 404 Not Found"),
            Self::UpstreamStatus(code) => write!(
                f,
                "HTTP {} {}",
                code.as_u16(),
                code.canonical_reason().unwrap_or("Unknown")
            ),
            Self::Resolve {
                host,
                server,
                reason,
            } => write!(
                f,
                "Server not found ({host:?}, queried DNS server {server}): {reason}"
            ),
            Self::ShortRead { expected, received } => write!(
                f,
                "Short data returned from server (Content-Length {expected} received {received})"
            ),
        }
    }
}

impl std::error::Error for ProxyCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Hyper(e) => Some(e),
            Self::HyperUtil(e) => Some(e),
            Self::Http(e) => Some(e),
            Self::Dns(e) => Some(e),
            Self::NotFound
            | Self::UpstreamStatus(_)
            | Self::Resolve { .. }
            | Self::ShortRead { .. } => None,
        }
    }
}

impl From<std::io::Error> for ProxyCacheError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::Error> for ProxyCacheError {
    fn from(value: hyper::Error) -> Self {
        Self::Hyper(value)
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyCacheError {
    fn from(value: hyper_util::client::legacy::Error) -> Self {
        Self::HyperUtil(value)
    }
}

impl From<hyper::http::Error> for ProxyCacheError {
    fn from(value: hyper::http::Error) -> Self {
        Self::Http(value)
    }
}

impl From<hickory_proto::error::ProtoError> for ProxyCacheError {
    fn from(value: hickory_proto::error::ProtoError) -> Self {
        Self::Dns(value)
    }
}
