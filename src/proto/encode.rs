use bytes::{BufMut, BytesMut};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    Method, Version,
};

use crate::Request;

/// encode the request line and headers into `buf`, followed by the body.
///
/// missing `host` is derived from the uri authority; missing `content-length`
/// is derived from the body; `connection: close` is injected when `close` is
/// set and the caller did not already pick a connection mode.
pub(crate) fn encode_request(buf: &mut BytesMut, req: &Request, close: bool) {
    let method = req.method().as_str().as_bytes();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .as_bytes();

    let version: &[u8] = match req.version() {
        Version::HTTP_10 => b" HTTP/1.0\r\n",
        _ => b" HTTP/1.1\r\n",
    };

    buf.reserve(method.len() + 1 + path_and_query.len() + version.len());
    buf.put_slice(method);
    buf.put_slice(b" ");
    buf.put_slice(path_and_query);
    buf.put_slice(version);

    let headers = req.headers();

    if !headers.contains_key(HOST) {
        if let Some(host) = req.uri().host() {
            buf.put_slice(b"host: ");
            buf.put_slice(host.as_bytes());
            if let Some(port) = req.uri().port() {
                match port.as_str() {
                    "80" | "443" => {}
                    port => {
                        buf.put_slice(b":");
                        buf.put_slice(port.as_bytes());
                    }
                }
            }
            buf.put_slice(b"\r\n");
        }
    }

    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if !headers.contains_key(CONTENT_LENGTH) && !headers.contains_key(TRANSFER_ENCODING) {
        let body_len = req.body().len();
        if body_len > 0 || method_expects_body(req.method()) {
            buf.put_slice(b"content-length: ");
            buf.put_slice(body_len.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }

    if close && !headers.contains_key(CONNECTION) {
        buf.put_slice(b"connection: close\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(req.body());
}

fn method_expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}
