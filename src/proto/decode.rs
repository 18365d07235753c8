use bytes::{Buf, BytesMut};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    Response, StatusCode, Version,
};
use httparse::Status;

use crate::error::{Error, ParseError};

use super::codec::TransferCoding;

pub(crate) const MAX_HEADERS: usize = 128;

pub(crate) struct Head {
    pub(crate) response: Response<()>,
    pub(crate) coding: TransferCoding,
    /// peer signalled (or implied) it will close after this response.
    pub(crate) close: bool,
}

/// try to parse a response head out of `buf`. consumes the head bytes on
/// success and leaves body bytes in place. returns `None` when the head is
/// still incomplete.
pub(crate) fn decode_head(buf: &mut BytesMut) -> Result<Option<Head>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);

    let len = match parsed.parse(buf.as_ref())? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    let version = match parsed.version {
        Some(1) => Version::HTTP_11,
        _ => Version::HTTP_10,
    };

    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(ParseError::StatusCode)?;

    let mut map = HeaderMap::with_capacity(parsed.headers.len());
    let mut coding = TransferCoding::eof();
    let mut explicit_close = false;
    let mut keep_alive = false;

    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ParseError::HeaderName)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| ParseError::HeaderValue)?;

        if name == CONTENT_LENGTH {
            // chunked coding takes precedence when both are present.
            if !matches!(coding, TransferCoding::Chunked(..)) {
                let len = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(ParseError::ContentLength)?;
                coding = TransferCoding::length(len);
            }
        } else if name == TRANSFER_ENCODING {
            if header_token_contains(&value, "chunked") {
                coding = TransferCoding::chunked();
            }
        } else if name == CONNECTION {
            explicit_close |= header_token_contains(&value, "close");
            keep_alive |= header_token_contains(&value, "keep-alive");
        }

        map.append(name, value);
    }

    // responses with no framing at all run until the peer closes.
    if matches!(coding, TransferCoding::PlainEof) && body_expected(status) {
        coding = TransferCoding::Eof;
    }

    if !body_expected(status) {
        coding = TransferCoding::eof();
    }

    let close = match version {
        Version::HTTP_10 => !keep_alive,
        _ => explicit_close,
    };

    buf.advance(len);

    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = map;

    Ok(Some(Head {
        response,
        coding,
        close,
    }))
}

fn body_expected(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

fn header_token_contains(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Head {
        let mut buf = BytesMut::from(input);
        decode_head(&mut buf).unwrap().expect("complete head")
    }

    #[test]
    fn content_length_framed() {
        let head = parse(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello");
        assert_eq!(head.response.status(), StatusCode::OK);
        assert_eq!(head.coding, TransferCoding::length(5));
        assert!(!head.close);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let head = parse(
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\ntransfer-encoding: chunked\r\n\r\n",
        );
        assert_eq!(head.coding, TransferCoding::chunked());
    }

    #[test]
    fn connection_close_detected() {
        let head = parse(b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n");
        assert!(head.close);
    }

    #[test]
    fn http_10_closes_by_default() {
        let head = parse(b"HTTP/1.0 200 OK\r\ncontent-length: 0\r\n\r\n");
        assert!(head.close);

        let head = parse(b"HTTP/1.0 200 OK\r\nconnection: keep-alive\r\ncontent-length: 0\r\n\r\n");
        assert!(!head.close);
    }

    #[test]
    fn no_framing_reads_until_close() {
        let head = parse(b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(head.coding, TransferCoding::Eof);
        assert!(head.coding.is_close_delimited());
    }

    #[test]
    fn no_content_has_no_body() {
        let head = parse(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(head.coding, TransferCoding::PlainEof);
    }

    #[test]
    fn partial_head_wants_more() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-le"[..]);
        assert!(decode_head(&mut buf).unwrap().is_none());
        // nothing consumed on partial parse.
        assert_eq!(buf.len(), 27);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut buf = BytesMut::from(&b"not a response\r\n\r\n"[..]);
        assert!(decode_head(&mut buf).is_err());
    }

    #[test]
    fn bad_content_length_is_a_parse_error() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-length: huge\r\n\r\n"[..]);
        assert!(decode_head(&mut buf).is_err());
    }
}
