#![allow(dead_code)]

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};

/// raw request as a miniature test server sees it.
pub struct RawRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    pub fn has_header(&self, name: &str, value: &str) -> bool {
        let needle = format!("{name}: {value}");
        self.head
            .lines()
            .skip(1)
            .any(|l| l.eq_ignore_ascii_case(&needle))
    }

    pub fn has_header_name(&self, name: &str) -> bool {
        let needle = format!("{name}:");
        self.head
            .lines()
            .skip(1)
            .any(|l| l.to_ascii_lowercase().starts_with(&needle.to_ascii_lowercase()))
    }
}

/// read one request off the stream. `buf` carries leftover bytes between
/// calls so pipelined requests survive intact. `None` on a clean close.
pub async fn read_request<S>(conn: &mut S, buf: &mut Vec<u8>) -> Option<RawRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            break pos;
        }
        let n = conn.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();

    let total = head_end + 4 + content_length(&head);
    while buf.len() < total {
        let n = conn.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = buf[head_end + 4..total].to_vec();
    buf.drain(..total);

    Some(RawRequest { head, body })
}

pub fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn close_response(body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// serve every accepted connection with a fixed body until the listener task
/// is dropped. keep-alive friendly.
pub fn spawn_fixed_server(listener: TcpListener, body: &'static [u8]) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while read_request(&mut conn, &mut buf).await.is_some() {
                    if conn.write_all(&ok_response(body)).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}

/// serve every accepted connection by echoing the request body back.
pub fn spawn_echo_server(listener: TcpListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some(req) = read_request(&mut conn, &mut buf).await {
                    if conn.write_all(&ok_response(&req.body)).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}

pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}
