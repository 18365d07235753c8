use core::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use std::{
    io,
    sync::{Arc, OnceLock},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{trace, warn};

use crate::{
    connect::{default_dialer, host_part, AddrList, Dial, DialDyn, Dialer},
    connection::ConnStream,
    error::{Error, TimeoutKind},
    proto::{self, Limits, Progress},
    timeout::Timer,
    tls::{Connector, TlsConnect},
    Request, Response,
};

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// per origin pipelined transport: a small set of long lived connections,
/// each carrying many in-flight requests. a writer encodes requests in order
/// and a reader assigns responses back in the same order, which is the only
/// correlation http/1.1 pipelining has.
///
/// there is no retry inside the pipeline: a mid stream failure is
/// indistinguishable across in-flight requests, so every pending request
/// fails with the observed error and callers decide what to replay.
///
/// # Examples
/// ```rust,no_run
/// use fleethttp::PipelineClient;
///
/// # async fn _main() -> Result<(), fleethttp::error::Error> {
/// let pipeline = PipelineClient::builder("example.com:80")
///     .set_max_conns(3)
///     .finish();
///
/// let req = http::Request::builder()
///     .uri("/ping")
///     .body(bytes::Bytes::new())
///     .unwrap();
///
/// let res = pipeline.send(req).await?;
/// assert!(res.status().is_success());
/// # Ok(())
/// # }
/// ```
pub struct PipelineClient {
    inner: Arc<PipelineInner>,
}

impl Clone for PipelineClient {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PipelineInner {
    shared: Arc<PipelineShared>,
    workers: OnceLock<Box<[Worker]>>,
    max_conns: usize,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get() {
            for worker in workers.iter() {
                worker.handle.abort();
            }
        }
    }
}

/// configuration shared with the connection workers.
struct PipelineShared {
    addr: AddrList,
    dialer: Dialer,
    connector: Arc<Connector>,
    use_tls: bool,
    max_pending_requests: usize,
    max_batch_delay: Duration,
    max_idle_conn_duration: Duration,
    limits: Limits,
    read_buffer_size: usize,
}

struct Worker {
    tx: mpsc::Sender<WorkItem>,
    queued: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

struct WorkItem {
    req: Request,
    done: Done,
}

/// completion side of one submitted request. dropping it without an explicit
/// completion still signals the caller and releases the queue slot, so a
/// dying worker can never strand a caller.
struct Done {
    tx: Option<oneshot::Sender<Result<Response, Error>>>,
    queued: Arc<AtomicUsize>,
    head_method: bool,
}

impl Done {
    fn complete(mut self, res: Result<Response, Error>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(res);
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(worker_gone()));
        }
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

fn worker_gone() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "pipeline connection worker terminated",
    ))
}

/// every pending request observes the failure that killed its connection.
/// io errors are not clonable, so the fan out carries the message.
fn broadcast_error(e: &Error) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("pipeline connection failed: {e}"),
    ))
}

impl PipelineClient {
    /// Start a builder for the given origin. `addr` is a comma separated
    /// `host[:port]` list; workers round robin across the entries.
    pub fn builder(addr: impl Into<String>) -> PipelineClientBuilder {
        PipelineClientBuilder::new(addr)
    }

    /// Submit the request into the pipeline and wait for its response.
    /// Returns [Error::PipelineOverflow] immediately when every connection
    /// queue is at capacity; callers retry after a short sleep.
    pub async fn send(&self, req: Request) -> Result<Response, Error> {
        self.send_inner(req, Timer::unbounded()).await
    }

    /// [send](Self::send) with `deadline = now + timeout`.
    pub async fn send_timeout(&self, req: Request, timeout: Duration) -> Result<Response, Error> {
        self.send_inner(req, Timer::deadline(Instant::now() + timeout)).await
    }

    /// [send](Self::send) with an absolute deadline. On expiry the completion
    /// wait is abandoned; the request itself is not recalled from the wire.
    pub async fn send_deadline(&self, req: Request, deadline: Instant) -> Result<Response, Error> {
        self.send_inner(req, Timer::deadline(deadline)).await
    }

    /// Requests submitted and not yet completed, across all connections.
    pub fn pending_requests(&self) -> usize {
        match self.inner.workers.get() {
            Some(workers) => workers.iter().map(|w| w.queued.load(Ordering::Acquire)).sum(),
            None => 0,
        }
    }

    async fn send_inner(&self, req: Request, mut timer: Timer) -> Result<Response, Error> {
        let workers = self.workers();

        // shortest queue first; the counters are advisory so ties and races
        // only cost fairness, never correctness.
        let mut order: Vec<usize> = (0..workers.len()).collect();
        order.sort_by_key(|&i| workers[i].queued.load(Ordering::Acquire));

        let mut req = req;
        let mut rx = None;

        for &i in &order {
            let worker = &workers[i];
            let (done_tx, done_rx) = oneshot::channel();
            worker.queued.fetch_add(1, Ordering::AcqRel);

            let item = WorkItem {
                req,
                done: Done {
                    tx: Some(done_tx),
                    queued: worker.queued.clone(),
                    head_method: false,
                },
            };

            match worker.tx.try_send(item) {
                Ok(()) => {
                    rx = Some(done_rx);
                    break;
                }
                Err(mpsc::error::TrySendError::Full(item))
                | Err(mpsc::error::TrySendError::Closed(item)) => {
                    let WorkItem { req: back, done } = item;
                    req = back;
                    drop(done);
                }
            }
        }

        let rx = rx.ok_or(Error::PipelineOverflow)?;

        match timer.bound(rx).await {
            // deadline passed: abandon the wait. the worker completes into a
            // dropped receiver and cleans up on its own.
            Err(()) => Err(Error::Timeout(TimeoutKind::Request)),
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(worker_gone()),
        }
    }

    fn workers(&self) -> &[Worker] {
        self.inner.workers.get_or_init(|| {
            let shared = &self.inner.shared;
            (0..self.max_conns())
                .map(|id| {
                    let (tx, rx) = mpsc::channel(shared.max_pending_requests);
                    let queued = Arc::new(AtomicUsize::new(0));
                    let handle = tokio::spawn(worker_loop(shared.clone(), id, rx));
                    Worker { tx, queued, handle }
                })
                .collect()
        })
    }

    fn max_conns(&self) -> usize {
        self.inner.max_conns
    }
}

async fn worker_loop(shared: Arc<PipelineShared>, id: usize, mut rx: mpsc::Receiver<WorkItem>) {
    let mut backoff = BACKOFF_BASE;

    loop {
        // connections are lazy: dial only once there is demand.
        let Some(first) = rx.recv().await else { return };

        match connect(&shared).await {
            Err(e) => {
                warn!(conn = id, error = %e, "pipeline dial failed");
                let copy = broadcast_error(&e);
                first.done.complete(Err(copy));
                drain_submissions(&mut rx, &e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
            Ok(stream) => {
                backoff = BACKOFF_BASE;
                match run_conn(&shared, &mut rx, first, stream).await {
                    ConnExit::Shutdown => return,
                    ConnExit::Idle => {
                        trace!(conn = id, "pipeline connection idle, closing");
                    }
                    ConnExit::Failed(e) => {
                        warn!(conn = id, error = %e, "pipeline connection failed");
                        drain_submissions(&mut rx, &e);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        }
    }
}

async fn connect(shared: &PipelineShared) -> Result<ConnStream, Error> {
    let addr = shared.addr.next();
    let stream = shared.dialer.dial_dyn(addr).await?;

    if shared.use_tls {
        let io = shared.connector.connect(stream, host_part(addr)).await?;
        Ok(ConnStream::from(io))
    } else {
        Ok(stream)
    }
}

fn drain_submissions(rx: &mut mpsc::Receiver<WorkItem>, e: &Error) {
    while let Ok(item) = rx.try_recv() {
        item.done.complete(Err(broadcast_error(e)));
    }
}

enum ConnExit {
    /// submission channel closed: the client is gone.
    Shutdown,
    /// no traffic for the idle threshold; close and redial on demand.
    Idle,
    Failed(Error),
}

enum WriteExit {
    Shutdown,
    Idle,
    WriteFailed(Error),
    /// reader task already terminated with this error.
    ReaderFailed(Error),
}

async fn run_conn(
    shared: &Arc<PipelineShared>,
    rx: &mut mpsc::Receiver<WorkItem>,
    first: WorkItem,
    stream: ConnStream,
) -> ConnExit {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (infl_tx, infl_rx) = mpsc::channel::<Inflight>(shared.max_pending_requests);

    let mut reader = tokio::spawn(read_loop(shared.clone(), read_half, infl_rx));

    let exit = write_loop(shared, rx, first, &mut write_half, &infl_tx, &mut reader).await;

    drop(infl_tx);
    let _ = write_half.shutdown().await;

    match exit {
        WriteExit::ReaderFailed(e) => ConnExit::Failed(e),
        WriteExit::WriteFailed(e) => {
            // the reader may be blocked on a response that will never come;
            // aborting it drops the in-flight completions, which fail their
            // callers on their own.
            reader.abort();
            let _ = reader.await;
            ConnExit::Failed(e)
        }
        WriteExit::Idle => {
            // in-flight queue is empty; the reader ends on channel close.
            let _ = reader.await;
            ConnExit::Idle
        }
        WriteExit::Shutdown => {
            // let outstanding responses drain before the worker exits.
            let _ = reader.await;
            ConnExit::Shutdown
        }
    }
}

struct Inflight {
    done: Done,
}

async fn write_loop(
    shared: &Arc<PipelineShared>,
    rx: &mut mpsc::Receiver<WorkItem>,
    first: WorkItem,
    write_half: &mut WriteHalf<ConnStream>,
    infl_tx: &mpsc::Sender<Inflight>,
    reader: &mut JoinHandle<Option<Error>>,
) -> WriteExit {
    let mut wbuf = BytesMut::with_capacity(shared.limits.write_buffer_size);
    let mut next = Some(first);

    loop {
        let item = match next.take() {
            Some(item) => item,
            None => {
                let idle = shared.max_idle_conn_duration;
                let inflight_empty = infl_tx.capacity() == shared.max_pending_requests;

                tokio::select! {
                    res = &mut *reader => return WriteExit::ReaderFailed(reader_error(res)),
                    got = rx.recv() => match got {
                        Some(item) => item,
                        None => return WriteExit::Shutdown,
                    },
                    _ = tokio::time::sleep(idle), if !idle.is_zero() && inflight_empty => {
                        return WriteExit::Idle;
                    }
                }
            }
        };

        // the in-flight fifo is the correlation: enqueue before encoding so
        // reader position k always matches writer position k.
        if let Err(exit) = enqueue_and_encode(item, infl_tx, &mut wbuf, reader).await {
            return exit;
        }

        // optional batching: keep coalescing work that is already available
        // (or arrives within the delay) into one flush.
        if !shared.max_batch_delay.is_zero() {
            let flush_at = Instant::now() + shared.max_batch_delay;
            loop {
                if infl_tx.capacity() == 0 {
                    // next item would overflow the in-flight fifo.
                    break;
                }
                match rx.try_recv() {
                    Ok(item) => {
                        if let Err(exit) = enqueue_and_encode(item, infl_tx, &mut wbuf, reader).await {
                            return exit;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {
                        let now = Instant::now();
                        if now >= flush_at {
                            break;
                        }
                        match tokio::time::timeout(flush_at - now, rx.recv()).await {
                            Ok(Some(item)) => {
                                if let Err(exit) =
                                    enqueue_and_encode(item, infl_tx, &mut wbuf, reader).await
                                {
                                    return exit;
                                }
                            }
                            // channel closed or delay elapsed: flush what we have.
                            Ok(None) | Err(_) => break,
                        }
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
        }

        let mut progress = Progress::default();
        if let Err(e) =
            proto::write_all(write_half, &mut wbuf, shared.limits.write_timeout, &mut progress).await
        {
            return WriteExit::WriteFailed(e);
        }
    }
}

async fn enqueue_and_encode(
    item: WorkItem,
    infl_tx: &mpsc::Sender<Inflight>,
    wbuf: &mut BytesMut,
    reader: &mut JoinHandle<Option<Error>>,
) -> Result<(), WriteExit> {
    let WorkItem { req, mut done } = item;
    done.head_method = req.method() == http::Method::HEAD;

    if infl_tx.send(Inflight { done }).await.is_err() {
        // reader dropped its end: the connection is dead.
        return Err(WriteExit::ReaderFailed(reader_error((&mut *reader).await)));
    }

    proto::encode_request(wbuf, &req, false);
    Ok(())
}

fn reader_error(res: Result<Option<Error>, tokio::task::JoinError>) -> Error {
    match res {
        Ok(Some(e)) => e,
        _ => worker_gone(),
    }
}

async fn read_loop(
    shared: Arc<PipelineShared>,
    mut read_half: ReadHalf<ConnStream>,
    mut infl_rx: mpsc::Receiver<Inflight>,
) -> Option<Error> {
    let mut rbuf = BytesMut::with_capacity(shared.read_buffer_size);

    while let Some(Inflight { done }) = infl_rx.recv().await {
        let method = if done.head_method {
            http::Method::HEAD
        } else {
            http::Method::GET
        };

        let mut progress = Progress::default();
        match proto::read_response(&mut read_half, &mut rbuf, &method, &shared.limits, &mut progress)
            .await
        {
            Ok((res, _reuse)) => done.complete(Ok(res)),
            Err(e) => {
                let copy = broadcast_error(&e);
                while let Ok(pending) = infl_rx.try_recv() {
                    pending.done.complete(Err(broadcast_error(&e)));
                }
                done.complete(Err(e));
                return Some(copy);
            }
        }
    }

    None
}

/// Builder type for [PipelineClient].
pub struct PipelineClientBuilder {
    addr: String,
    dialer: Option<Dialer>,
    connector: Option<Arc<Connector>>,
    use_tls: bool,
    max_conns: usize,
    max_pending_requests: usize,
    max_batch_delay: Duration,
    max_idle_conn_duration: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    read_buffer_size: usize,
    write_buffer_size: usize,
    max_response_body_size: usize,
}

impl PipelineClientBuilder {
    pub(crate) fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dialer: None,
            connector: None,
            use_tls: false,
            max_conns: 1,
            max_pending_requests: 1024,
            max_batch_delay: Duration::ZERO,
            max_idle_conn_duration: Duration::from_secs(10),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_response_body_size: 0,
        }
    }

    /// Use a custom transport dialer instead of the default tcp dial.
    pub fn dial<D>(mut self, dialer: D) -> Self
    where
        D: Dial + 'static,
    {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Treat this origin as tls and handshake through the given connector.
    pub fn tls_connector<T>(mut self, connector: T) -> Self
    where
        T: TlsConnect + 'static,
    {
        self.connector = Some(Arc::new(Connector::custom(connector)));
        self.use_tls = true;
        self
    }

    #[cfg(feature = "rustls")]
    /// Treat this origin as tls, handshaking with rustls and webpki roots.
    pub fn rustls(mut self) -> Self {
        self.connector = Some(Arc::new(Connector::rustls()));
        self.use_tls = true;
        self
    }

    /// Number of pipelined connections.
    ///
    /// Default to 1.
    pub fn set_max_conns(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.max_conns = max;
        self
    }

    /// Per connection queue depth.
    ///
    /// Default to 1024.
    pub fn set_max_pending_requests(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.max_pending_requests = max;
        self
    }

    /// Extra latency the writer may wait to coalesce several requests into
    /// one flush. Zero flushes per request.
    pub fn set_max_batch_delay(mut self, dur: Duration) -> Self {
        self.max_batch_delay = dur;
        self
    }

    /// Close a pipelined connection after this long without traffic; it is
    /// redialed on demand. Zero disables the limit.
    ///
    /// Default to 10 seconds.
    pub fn set_max_idle_conn_duration(mut self, dur: Duration) -> Self {
        self.max_idle_conn_duration = dur;
        self
    }

    /// Timeout for individual socket reads. Zero disables it.
    pub fn set_read_timeout(mut self, dur: Duration) -> Self {
        self.read_timeout = dur;
        self
    }

    /// Timeout for individual socket writes and flushes. Zero disables it.
    pub fn set_write_timeout(mut self, dur: Duration) -> Self {
        self.write_timeout = dur;
        self
    }

    /// Initial capacity for the per connection read buffer.
    ///
    /// Default to 4 KiB.
    pub fn set_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Initial capacity for the per connection write buffer.
    ///
    /// Default to 4 KiB.
    pub fn set_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Reject response bodies larger than this. Zero disables the limit.
    pub fn set_max_response_body_size(mut self, size: usize) -> Self {
        self.max_response_body_size = size;
        self
    }

    /// Finish the builder and construct a [PipelineClient]. Connection
    /// workers start lazily on the first request.
    pub fn finish(self) -> PipelineClient {
        let default_port = if self.use_tls { 443 } else { 80 };
        let addr = AddrList::new(&self.addr, default_port);
        assert!(!addr.is_empty(), "PipelineClient requires at least one address");

        PipelineClient {
            inner: Arc::new(PipelineInner {
                shared: Arc::new(PipelineShared {
                    addr,
                    dialer: self.dialer.unwrap_or_else(default_dialer),
                    connector: self.connector.unwrap_or_else(|| Arc::new(Connector::Nop)),
                    use_tls: self.use_tls,
                    max_pending_requests: self.max_pending_requests,
                    max_batch_delay: self.max_batch_delay,
                    max_idle_conn_duration: self.max_idle_conn_duration,
                    limits: Limits {
                        read_timeout: self.read_timeout,
                        write_timeout: self.write_timeout,
                        write_buffer_size: self.write_buffer_size,
                        max_response_body_size: self.max_response_body_size,
                    },
                    read_buffer_size: self.read_buffer_size,
                }),
                workers: OnceLock::new(),
                max_conns: self.max_conns,
            }),
        }
    }
}
