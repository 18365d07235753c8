use std::{error, fmt, io};

/// Phase a deadline expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    TlsHandshake,
    Request,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// the per host connection limit is reached and no idle connection is available.
    /// transient. caller is expected to retry at a later point.
    NoFreeConnections,
    /// deadline elapsed before the call could finish. never retried internally.
    Timeout(TimeoutKind),
    /// all pipeline submission queues are at capacity. transient.
    PipelineOverflow,
    /// host name did not resolve to any address.
    Resolve(ResolveError),
    /// establishing a new connection failed.
    Dial(io::Error),
    /// io failure on an established connection.
    Io(io::Error),
    /// peer closed the connection before sending any response byte.
    PeerClosed,
    /// received bytes could not be parsed as an http response.
    Parse(ParseError),
    /// response body exceeded the configured limit.
    BodyTooLarge,
    /// redirect chain exceeded the caller provided limit.
    TooManyRedirects,
    InvalidUri(InvalidUri),
    /// request uri asks for tls but no tls connector is configured.
    TlsNotEnabled,
    #[cfg(feature = "rustls")]
    Rustls(RustlsError),
    Std(Box<dyn error::Error + Send + Sync>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Box<dyn error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self::Std(e)
    }
}

impl From<TimeoutKind> for Error {
    fn from(e: TimeoutKind) -> Self {
        Self::Timeout(e)
    }
}

#[derive(Debug)]
pub struct ResolveError {
    host: String,
}

impl ResolveError {
    pub(crate) fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

#[derive(Debug)]
pub enum ParseError {
    Head(httparse::Error),
    StatusCode,
    HeaderName,
    HeaderValue,
    ContentLength,
    ChunkSize,
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Self::Parse(ParseError::Head(e))
    }
}

#[derive(Debug)]
pub enum InvalidUri {
    MissingHost,
    MissingScheme,
    UnknownScheme,
    Other(http::uri::InvalidUri),
}

impl From<http::uri::InvalidUri> for Error {
    fn from(e: http::uri::InvalidUri) -> Self {
        Self::InvalidUri(InvalidUri::Other(e))
    }
}

impl From<InvalidUri> for Error {
    fn from(e: InvalidUri) -> Self {
        Self::InvalidUri(e)
    }
}

#[cfg(feature = "rustls")]
#[derive(Debug)]
pub enum RustlsError {
    InvalidDnsName,
    Io(io::Error),
}

#[cfg(feature = "rustls")]
impl From<RustlsError> for Error {
    fn from(e: RustlsError) -> Self {
        Self::Rustls(e)
    }
}

impl Error {
    /// true when the failure happened at the transport layer, before or while a
    /// connection carried the request. parse failures and timeouts are excluded
    /// on purpose: the former means the server produced a response of some kind,
    /// the latter means the caller asked for bounded latency.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self, Self::Dial(_) | Self::Io(_) | Self::PeerClosed)
    }
}
