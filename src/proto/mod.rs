//! minimal http/1.1 client framing: request head encode, response head
//! decode and body transfer decode. connection management above decides when
//! to reuse or close; this layer only reports what the wire said.

mod codec;
mod decode;
mod encode;

use core::{future::Future, time::Duration};

use std::io;

use bytes::{Buf, BytesMut};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    connection::PooledConn,
    error::{Error, TimeoutKind},
    Request, Response,
};

pub(crate) use self::codec::TransferCoding;
pub(crate) use self::decode::decode_head;
pub(crate) use self::encode::encode_request;

/// caller already asked for this request to close the connection.
pub(crate) fn wants_close(headers: &http::HeaderMap) -> bool {
    headers.get(http::header::CONNECTION).is_some_and(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    })
}

/// per operation limits. zero means unlimited, matching the builder defaults.
#[derive(Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) write_buffer_size: usize,
    pub(crate) max_response_body_size: usize,
}

/// how far an attempt got on the wire. drives the idempotence aware retry
/// policy: a request whose bytes never reached the peer is always safe to
/// replay, a response that started arriving never is.
#[derive(Default, Clone, Copy)]
pub(crate) struct Progress {
    pub(crate) wrote_any: bool,
    pub(crate) read_any: bool,
}

async fn io_op<F, T>(dur: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = io::Result<T>>,
{
    if dur.is_zero() {
        fut.await.map_err(Error::Io)
    } else {
        match tokio::time::timeout(dur, fut).await {
            Ok(res) => res.map_err(Error::Io),
            Err(_) => Err(Error::Timeout(TimeoutKind::Request)),
        }
    }
}

/// drain `buf` into the stream and flush.
pub(crate) async fn write_all<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    write_timeout: Duration,
    progress: &mut Progress,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    while buf.has_remaining() {
        let n = io_op(write_timeout, stream.write(buf.chunk())).await?;
        if n == 0 {
            return Err(Error::Io(io::ErrorKind::WriteZero.into()));
        }
        progress.wrote_any = true;
        buf.advance(n);
    }
    io_op(write_timeout, stream.flush()).await
}

/// read one full response off the stream. informational responses are
/// skipped. returns the response and whether the connection may be reused as
/// far as the peer is concerned.
pub(crate) async fn read_response<S>(
    stream: &mut S,
    rbuf: &mut BytesMut,
    method: &Method,
    limits: &Limits,
    progress: &mut Progress,
) -> Result<(Response, bool), Error>
where
    S: AsyncRead + Unpin,
{
    let head = loop {
        if let Some(head) = decode_head(rbuf)? {
            progress.read_any = true;
            if head.response.status().is_informational() {
                continue;
            }
            break head;
        }

        let n = io_op(limits.read_timeout, stream.read_buf(rbuf)).await?;
        if n == 0 {
            return Err(if progress.read_any || !rbuf.is_empty() {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            } else {
                Error::PeerClosed
            });
        }
        progress.read_any = true;
    };

    trace!(status = %head.response.status(), "response head decoded");

    let mut coding = head.coding;
    if *method == Method::HEAD {
        coding = TransferCoding::eof();
    }
    let close_delimited = coding.is_close_delimited();

    let mut body = BytesMut::new();
    loop {
        let done = coding.decode(rbuf, &mut body)?;
        if limits.max_response_body_size != 0 && body.len() > limits.max_response_body_size {
            return Err(Error::BodyTooLarge);
        }
        if done {
            break;
        }

        let n = io_op(limits.read_timeout, stream.read_buf(rbuf)).await?;
        if n == 0 {
            if close_delimited {
                break;
            }
            // peer closed before the declared body length arrived. a partial
            // body must never be surfaced as success.
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
    }

    let reuse = !(head.close || close_delimited);
    let (parts, ()) = head.response.into_parts();
    Ok((Response::from_parts(parts, body.freeze()), reuse))
}

/// one request/response exchange on an owned connection.
pub(crate) async fn send_request(
    conn: &mut PooledConn,
    req: &Request,
    close: bool,
    limits: &Limits,
    progress: &mut Progress,
) -> Result<(Response, bool), Error> {
    let mut wbuf = BytesMut::with_capacity(limits.write_buffer_size);
    encode_request(&mut wbuf, req, close);

    write_all(&mut conn.stream, &mut wbuf, limits.write_timeout, progress).await?;

    let (res, reuse) =
        read_response(&mut conn.stream, &mut conn.read_buf, req.method(), limits, progress).await?;

    Ok((res, reuse && !close))
}
