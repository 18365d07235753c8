use core::time::Duration;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use fleethttp::{error::Error, ConnStream, Dial, PipelineClient};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

use common::{bind, ok_response, read_request, spawn_fixed_server};

fn request(uri: &str) -> fleethttp::Request {
    http::Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Bytes::new())
        .unwrap()
}

#[tokio::test]
async fn serial_round_trips() {
    let (listener, addr) = bind().await;
    let _server = spawn_fixed_server(listener, b"OK");

    let pipeline = PipelineClient::builder(addr).finish();

    for i in 0..5 {
        let res = pipeline.send(request(&format!("/seq/{i}"))).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(&res.body()[..], b"OK");
    }

    assert_eq!(pipeline.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batched_multi_conn() {
    let (listener, addr) = bind().await;
    let _server = spawn_fixed_server(listener, b"OK");

    let pipeline = Arc::new(
        PipelineClient::builder(addr)
            .set_max_conns(3)
            .set_max_batch_delay(Duration::from_millis(5))
            .set_max_pending_requests(16)
            .finish(),
    );

    let mut tasks = Vec::new();
    for worker in 0..10 {
        let pipeline = pipeline.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..10 {
                loop {
                    let req = request(&format!("/w{worker}/r{round}"));
                    // alternate the deadline and plain variants.
                    let res = if round % 2 == 0 {
                        pipeline.send(req).await
                    } else {
                        pipeline.send_timeout(req, Duration::from_secs(5)).await
                    };

                    match res {
                        Ok(res) => {
                            assert_eq!(res.status(), 200);
                            assert_eq!(&res.body()[..], b"OK");
                            break;
                        }
                        // queues full: back off briefly and resubmit.
                        Err(Error::PipelineOverflow) => {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(pipeline.pending_requests(), 0);
}

#[tokio::test]
async fn overflow_reported_immediately() {
    // a dialer whose connections never answer, so submissions pile up.
    struct SilentDialer;

    impl Dial for SilentDialer {
        async fn dial(&self, _addr: &str) -> Result<ConnStream, Error> {
            let (client, mut server) = tokio::io::duplex(1 << 16);
            tokio::spawn(async move {
                let mut sink = [0u8; 1024];
                loop {
                    match server.read(&mut sink).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
            Ok(ConnStream::boxed(client))
        }
    }

    let pipeline = PipelineClient::builder("silent")
        .dial(SilentDialer)
        .set_max_conns(1)
        .set_max_pending_requests(2)
        .finish();

    // fill the submission queue without waiting for completions.
    let mut waiters = Vec::new();
    for i in 0..8 {
        let pipeline = pipeline.clone();
        let req = request(&format!("/fill/{i}"));
        waiters.push(tokio::spawn(async move {
            pipeline.send_timeout(req, Duration::from_millis(500)).await
        }));
    }

    // give the submissions time to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // with every queue at capacity a fresh call fails fast.
    let err = pipeline.send(request("/overflow")).await.unwrap_err();
    assert!(matches!(err, Error::PipelineOverflow), "got {err}");

    for w in waiters {
        // the parked submissions run into their deadlines.
        let res = w.await.unwrap();
        assert!(res.is_err());
    }
}

#[tokio::test]
async fn dial_failure_fails_pending_and_recovers() {
    struct FlakyDialer {
        calls: AtomicUsize,
        good_addr: String,
    }

    impl Dial for FlakyDialer {
        async fn dial(&self, _addr: &str) -> Result<ConnStream, Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Dial(std::io::ErrorKind::ConnectionRefused.into()));
            }
            let stream = tokio::net::TcpStream::connect(&self.good_addr)
                .await
                .map_err(Error::Dial)?;
            Ok(ConnStream::from(stream))
        }
    }

    let (listener, good_addr) = bind().await;
    let _server = spawn_fixed_server(listener, b"back");

    let pipeline = PipelineClient::builder("flaky")
        .dial(FlakyDialer {
            calls: AtomicUsize::new(0),
            good_addr,
        })
        .finish();

    // first call hits the dial failure; no retry happens inside the pipeline.
    let err = pipeline.send(request("/first")).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)), "got {err}");

    // the worker redials after its back off and service resumes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let res = pipeline.send(request("/second")).await.unwrap();
    assert_eq!(&res.body()[..], b"back");

    assert_eq!(pipeline.pending_requests(), 0);
}

#[tokio::test]
async fn mid_stream_failure_fails_in_flight() {
    let (listener, addr) = bind().await;

    // answer the first request on each connection, then slam it shut.
    let _server = tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                if read_request(&mut conn, &mut Vec::new()).await.is_some() {
                    let _ = conn.write_all(&ok_response(b"one")).await;
                }
            });
        }
    });

    let pipeline = PipelineClient::builder(addr).finish();

    let res = pipeline.send(request("/a")).await.unwrap();
    assert_eq!(&res.body()[..], b"one");

    // wait out the server side close.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the next submission rides the dead connection and fails; the one after
    // that lands on a fresh one.
    let second = pipeline.send(request("/b")).await;
    match second {
        Ok(res) => assert_eq!(&res.body()[..], b"one"),
        Err(e) => assert!(matches!(e, Error::Io(_) | Error::PeerClosed), "got {e}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let res = pipeline.send(request("/c")).await.unwrap();
    assert_eq!(&res.body()[..], b"one");
}

#[tokio::test]
async fn deadline_abandons_the_wait() {
    let (listener, addr) = bind().await;

    let _server = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                return;
            };
            held.push(conn);
        }
    });

    let pipeline = PipelineClient::builder(addr).finish();

    let err = pipeline
        .send_timeout(request("/never"), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err}");
}
