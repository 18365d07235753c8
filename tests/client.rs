use core::time::Duration;

use bytes::Bytes;
use fleethttp::{error::Error, Client, ConnStream, Dial};
use http::Method;
use tokio::io::AsyncWriteExt;

mod common;

use common::{bind, ok_response, read_request, spawn_echo_server, spawn_fixed_server};

#[tokio::test]
async fn routes_by_origin() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;
    let _a = spawn_fixed_server(listener_a, b"from-a");
    let _b = spawn_fixed_server(listener_b, b"from-b");

    let client = Client::new();

    let res = client.get(&format!("http://{addr_a}/")).await.unwrap();
    assert_eq!(&res.body()[..], b"from-a");

    let res = client.get(&format!("http://{addr_b}/")).await.unwrap();
    assert_eq!(&res.body()[..], b"from-b");

    // one host client per origin, reused on repeat calls.
    assert_eq!(client.host_count(), 2);
    client.get(&format!("http://{addr_a}/again")).await.unwrap();
    assert_eq!(client.host_count(), 2);

    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn post_echoes_body() {
    let (listener, addr) = bind().await;
    let _server = spawn_echo_server(listener);

    let client = Client::new();
    let res = client
        .post(&format!("http://{addr}/submit"), &b"a=1&b=2"[..])
        .await
        .unwrap();
    assert_eq!(&res.body()[..], b"a=1&b=2");
}

#[tokio::test]
async fn send_timeout_applies_to_whole_call() {
    let (listener, addr) = bind().await;

    // accept and hold without answering.
    let _server = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                return;
            };
            held.push(conn);
        }
    });

    let client = Client::new();
    let req = http::Request::builder()
        .method(Method::GET)
        .uri(format!("http://{addr}/"))
        .body(Bytes::new())
        .unwrap();

    let err = client
        .send_timeout(req, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err}");
}

#[tokio::test]
async fn follows_redirects() {
    let (listener, addr) = bind().await;

    let _server = tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some(req) = read_request(&mut conn, &mut buf).await {
                    let wire = match req.request_line() {
                        line if line.starts_with("GET /start") => {
                            b"HTTP/1.1 302 Found\r\nlocation: /hop\r\ncontent-length: 0\r\n\r\n"
                                .to_vec()
                        }
                        line if line.starts_with("GET /hop") => {
                            b"HTTP/1.1 302 Found\r\nlocation: /final\r\ncontent-length: 0\r\n\r\n"
                                .to_vec()
                        }
                        _ => ok_response(b"landed"),
                    };
                    if conn.write_all(&wire).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let client = Client::new();

    let res = client
        .get_following_redirects(&format!("http://{addr}/start"), 5)
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(&res.body()[..], b"landed");

    // a budget of one hop is not enough for two redirects.
    let err = client
        .get_following_redirects(&format!("http://{addr}/start"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooManyRedirects), "got {err}");

    // without following, the redirect comes back as is.
    let res = client.get(&format!("http://{addr}/start")).await.unwrap();
    assert_eq!(res.status(), 302);
}

#[tokio::test]
async fn https_without_connector_is_rejected() {
    // dial succeeds locally; the handshake step is what must refuse.
    struct LoopbackDialer;

    impl Dial for LoopbackDialer {
        async fn dial(&self, _addr: &str) -> Result<ConnStream, Error> {
            let (client, _server) = tokio::io::duplex(64);
            Ok(ConnStream::boxed(client))
        }
    }

    let client = Client::builder().dial(LoopbackDialer).finish();
    let err = client.get("https://example.com/").await.unwrap_err();
    assert!(matches!(err, Error::TlsNotEnabled), "got {err}");
}

#[tokio::test]
async fn many_origins_concurrently() {
    let mut addrs = Vec::new();
    for _ in 0..4 {
        let (listener, addr) = bind().await;
        let _ = spawn_echo_server(listener);
        addrs.push(addr);
    }

    let client = Client::new();
    let mut tasks = Vec::new();

    for (i, addr) in addrs.iter().enumerate() {
        for _ in 0..5 {
            let client = client.clone();
            let uri = format!("http://{addr}/");
            let body = format!("payload-{i}");
            tasks.push(tokio::spawn(async move {
                let res = client.post(&uri, body.clone().into_bytes()).await.unwrap();
                assert_eq!(res.body(), body.as_bytes());
            }));
        }
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(client.host_count(), 4);
    assert_eq!(client.pending_requests(), 0);
}
