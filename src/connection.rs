use core::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use std::io;

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::Instant,
};

/// A trait impl for all types that impl [AsyncRead], [AsyncWrite], [Send] and
/// [Unpin]. Enabling `Box<dyn Io>` trait object usage.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S> Io for S where S: AsyncRead + AsyncWrite + Send + Unpin {}

/// one live transport connection. plain tcp stays unboxed; tls wrapped and
/// custom dialed streams ride the type erased arm.
pub struct ConnStream {
    inner: StreamKind,
}

enum StreamKind {
    Tcp(TcpStream),
    Boxed(Box<dyn Io>),
}

impl ConnStream {
    /// type erase a custom stream. used by [Dial](crate::Dial) implementations.
    pub fn boxed<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: StreamKind::Boxed(Box::new(io)),
        }
    }
}

impl From<TcpStream> for ConnStream {
    fn from(tcp: TcpStream) -> Self {
        Self {
            inner: StreamKind::Tcp(tcp),
        }
    }
}

impl From<Box<dyn Io>> for ConnStream {
    fn from(io: Box<dyn Io>) -> Self {
        Self {
            inner: StreamKind::Boxed(io),
        }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner {
            StreamKind::Tcp(ref mut io) => Pin::new(io).poll_read(cx, buf),
            StreamKind::Boxed(ref mut io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner {
            StreamKind::Tcp(ref mut io) => Pin::new(io).poll_write(cx, buf),
            StreamKind::Boxed(ref mut io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner {
            StreamKind::Tcp(ref mut io) => Pin::new(io).poll_flush(cx),
            StreamKind::Boxed(ref mut io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner {
            StreamKind::Tcp(ref mut io) => Pin::new(io).poll_shutdown(cx),
            StreamKind::Boxed(ref mut io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}

/// connection record as kept by the host pool: the stream, its read buffer
/// (decode leftovers must survive between requests on the same connection)
/// and the timestamps driving expiry.
pub(crate) struct PooledConn {
    pub(crate) stream: ConnStream,
    pub(crate) read_buf: BytesMut,
    pub(crate) created: Instant,
    pub(crate) idle_since: Instant,
    /// true once the connection has been returned to the pool and handed out
    /// again. retry policy keys off this.
    pub(crate) reused: bool,
}

impl PooledConn {
    pub(crate) fn new(stream: ConnStream, read_buffer_size: usize) -> Self {
        let now = Instant::now();
        Self {
            stream,
            read_buf: BytesMut::with_capacity(read_buffer_size),
            created: now,
            idle_since: now,
            reused: false,
        }
    }

    /// zero duration means no limit.
    pub(crate) fn expired(&self, max_idle: Duration) -> bool {
        !max_idle.is_zero() && self.idle_since.elapsed() > max_idle
    }

    pub(crate) fn past_lifetime(&self, max_conn_duration: Duration) -> bool {
        !max_conn_duration.is_zero() && self.created.elapsed() > max_conn_duration
    }
}
