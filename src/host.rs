use core::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use std::{cmp, sync::Arc};

use http::Method;
use tokio::{task::JoinHandle, time::Instant};
use tracing::trace;

use crate::{
    connect::{default_dialer, host_part, AddrList, Dial, DialDyn, Dialer},
    connection::{ConnStream, PooledConn},
    error::{Error, TimeoutKind},
    pool::{Acquired, ConnPool},
    proto::{self, Limits, Progress},
    timeout::Timer,
    tls::{Connector, TlsConnect},
    Request, Response,
};

/// per origin connection pool with request/response serialization over
/// reusable connections, idempotence aware retry and deadline enforcement.
///
/// # Examples
/// ```rust,no_run
/// use fleethttp::HostClient;
///
/// # async fn _main() -> Result<(), fleethttp::error::Error> {
/// let host = HostClient::builder("example.com:80").finish();
///
/// let req = http::Request::builder()
///     .uri("/status")
///     .body(bytes::Bytes::new())
///     .unwrap();
///
/// let res = host.send(req).await?;
/// assert!(res.status().is_success());
/// # Ok(())
/// # }
/// ```
pub struct HostClient {
    addr: AddrList,
    dialer: Dialer,
    connector: Arc<Connector>,
    use_tls: bool,
    pool: Arc<ConnPool>,
    limits: Limits,
    read_buffer_size: usize,
    max_conn_duration: Duration,
    max_retry_count: usize,
    pending: AtomicUsize,
    served: AtomicU64,
    sweeper: Option<JoinHandle<()>>,
}

impl Drop for HostClient {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

impl HostClient {
    /// Start a builder for the given origin. `addr` is a comma separated
    /// `host[:port]` list; dialing round robins across the entries.
    pub fn builder(addr: impl Into<String>) -> HostClientBuilder {
        HostClientBuilder::new(addr)
    }

    /// Send the request and wait for the full response, without an overall
    /// deadline. When the per host connection limit is reached this fails
    /// immediately with [Error::NoFreeConnections].
    pub async fn send(&self, req: Request) -> Result<Response, Error> {
        self.send_inner(req, Timer::unbounded()).await
    }

    /// [send](Self::send) with `deadline = now + timeout`.
    pub async fn send_timeout(&self, req: Request, timeout: Duration) -> Result<Response, Error> {
        self.send_inner(req, Timer::deadline(Instant::now() + timeout)).await
    }

    /// Send with an absolute deadline enforced across the acquire, dial,
    /// handshake, write and read phases. On expiry the owning connection is
    /// closed and [Error::Timeout] returned.
    pub async fn send_deadline(&self, req: Request, deadline: Instant) -> Result<Response, Error> {
        self.send_inner(req, Timer::deadline(deadline)).await
    }

    /// Number of calls currently inside this client. Purely observational.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Open connections: idle plus checked out plus dialing.
    pub fn open_connections(&self) -> usize {
        self.pool.open_count()
    }

    pub(crate) fn served_count(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    async fn send_inner(&self, req: Request, mut timer: Timer) -> Result<Response, Error> {
        let _pending = CounterGuard::enter(&self.pending);

        // replayable without observable side effects: idempotent by rfc 7231,
        // or nothing the server could have acted on.
        let replay_safe = is_idempotent(req.method()) || req.body().is_empty();

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(&req, &mut timer).await {
                Ok(res) => {
                    self.served.fetch_add(1, Ordering::Relaxed);
                    return Ok(res);
                }
                Err(failure) => {
                    if attempts <= self.max_retry_count && failure.should_retry(replay_safe) {
                        trace!(attempts, "retrying after transport failure");
                        continue;
                    }
                    return Err(failure.error);
                }
            }
        }
    }

    async fn attempt(&self, req: &Request, timer: &mut Timer) -> Result<Response, AttemptFailure> {
        let acquired = if timer.is_bounded() {
            self.pool.acquire_wait(timer).await
        } else {
            self.pool.try_acquire()
        }
        .map_err(AttemptFailure::plain)?;

        let mut guard = match acquired {
            Acquired::Conn(guard) => guard,
            Acquired::Permit(permit) => {
                // permit drop on any failure path gives the slot back.
                let addr = self.addr.next();

                let stream = match timer.bound(self.dialer.dial_dyn(addr)).await {
                    Err(()) => return Err(AttemptFailure::plain(TimeoutKind::Connect.into())),
                    Ok(Err(e)) => return Err(AttemptFailure::plain(e)),
                    Ok(Ok(stream)) => stream,
                };

                let stream = if self.use_tls {
                    match timer.bound(self.connector.connect(stream, host_part(addr))).await {
                        Err(()) => {
                            return Err(AttemptFailure::plain(TimeoutKind::TlsHandshake.into()))
                        }
                        Ok(Err(e)) => return Err(AttemptFailure::plain(as_dial_error(e))),
                        Ok(Ok(io)) => ConnStream::from(io),
                    }
                } else {
                    stream
                };

                permit.fulfill(PooledConn::new(stream, self.read_buffer_size))
            }
        };

        let reused = guard.conn().reused;

        // a connection past its lifetime serves one last request with
        // `connection: close` and is discarded afterwards.
        let close = proto::wants_close(req.headers())
            || guard.conn().past_lifetime(self.max_conn_duration);
        if close {
            guard.destroy_on_drop();
        }

        let mut progress = Progress::default();
        let send = proto::send_request(guard.conn_mut(), req, close, &self.limits, &mut progress);
        let res = timer.bound(send).await;

        match res {
            Err(()) => {
                // deadline hit mid flight. the connection carries unknown
                // wire state and must not be reused.
                guard.destroy_on_drop();
                Err(AttemptFailure {
                    error: TimeoutKind::Request.into(),
                    reused,
                    progress,
                })
            }
            Ok(Err(error)) => {
                guard.destroy_on_drop();
                Err(AttemptFailure {
                    error,
                    reused,
                    progress,
                })
            }
            Ok(Ok((response, reuse))) => {
                if !reuse {
                    guard.destroy_on_drop();
                }
                Ok(response)
            }
        }
    }
}

struct AttemptFailure {
    error: Error,
    reused: bool,
    progress: Progress,
}

impl AttemptFailure {
    fn plain(error: Error) -> Self {
        Self {
            error,
            reused: false,
            progress: Progress::default(),
        }
    }

    fn should_retry(&self, replay_safe: bool) -> bool {
        if !self.error.is_transport() {
            return false;
        }
        match self.error {
            // nothing was ever sent.
            Error::Dial(_) => replay_safe,
            // peer closed before a single response byte.
            Error::PeerClosed => replay_safe || self.reused,
            Error::Io(_) => {
                if replay_safe {
                    !self.progress.wrote_any
                } else {
                    self.reused && !self.progress.read_any
                }
            }
            _ => false,
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

fn as_dial_error(e: Error) -> Error {
    match e {
        Error::Io(io) => Error::Dial(io),
        #[cfg(feature = "rustls")]
        Error::Rustls(crate::error::RustlsError::Io(io)) => Error::Dial(io),
        e => e,
    }
}

struct CounterGuard<'a>(&'a AtomicUsize);

impl<'a> CounterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builder type for [HostClient]. Offers configuration before the client
/// instance is created.
pub struct HostClientBuilder {
    addr: String,
    dialer: Option<Dialer>,
    connector: Option<Arc<Connector>>,
    use_tls: bool,
    max_conns: usize,
    max_idle_conn_duration: Duration,
    max_conn_duration: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    read_buffer_size: usize,
    write_buffer_size: usize,
    max_response_body_size: usize,
    max_retry_count: usize,
}

impl HostClientBuilder {
    pub(crate) fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dialer: None,
            connector: None,
            use_tls: false,
            max_conns: 512,
            max_idle_conn_duration: Duration::from_secs(10),
            max_conn_duration: Duration::ZERO,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_response_body_size: 0,
            max_retry_count: 1,
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

    pub(crate) fn dialer_shared(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
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

    pub(crate) fn connector_shared(mut self, connector: Arc<Connector>, use_tls: bool) -> Self {
        self.connector = Some(connector);
        self.use_tls = use_tls;
        self
    }

    /// Maximum open connections to this origin.
    ///
    /// Default to 512.
    pub fn set_max_conns(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.max_conns = max;
        self
    }

    /// Close idle connections after this long. Zero disables the limit.
    ///
    /// Default to 10 seconds.
    pub fn set_max_idle_conn_duration(mut self, dur: Duration) -> Self {
        self.max_idle_conn_duration = dur;
        self
    }

    /// Lifetime cap per connection. A connection past it serves one last
    /// request with `connection: close`. Zero disables the limit.
    ///
    /// Default to unlimited.
    pub fn set_max_conn_duration(mut self, dur: Duration) -> Self {
        self.max_conn_duration = dur;
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

    /// Initial capacity for per connection read buffers.
    ///
    /// Default to 4 KiB.
    pub fn set_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Initial capacity for request encode buffers.
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

    /// Extra attempts after a retryable transport failure.
    ///
    /// Default to 1.
    pub fn set_max_retry_count(mut self, count: usize) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Finish the builder and construct a [HostClient].
    ///
    /// Must be called within a tokio runtime: the idle sweeper task is
    /// spawned here.
    pub fn finish(self) -> HostClient {
        let default_port = if self.use_tls { 443 } else { 80 };
        let addr = AddrList::new(&self.addr, default_port);
        assert!(!addr.is_empty(), "HostClient requires at least one address");

        let pool = Arc::new(ConnPool::new(self.max_conns, self.max_idle_conn_duration));

        let sweeper = (!self.max_idle_conn_duration.is_zero()).then(|| {
            let weak = Arc::downgrade(&pool);
            let period = cmp::max(self.max_idle_conn_duration / 2, Duration::from_millis(100));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    match weak.upgrade() {
                        Some(pool) => pool.sweep_idle(),
                        None => return,
                    }
                }
            })
        });

        HostClient {
            addr,
            dialer: self.dialer.unwrap_or_else(default_dialer),
            connector: self.connector.unwrap_or_else(|| Arc::new(Connector::Nop)),
            use_tls: self.use_tls,
            pool,
            limits: Limits {
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                write_buffer_size: self.write_buffer_size,
                max_response_body_size: self.max_response_body_size,
            },
            read_buffer_size: self.read_buffer_size,
            max_conn_duration: self.max_conn_duration,
            max_retry_count: self.max_retry_count,
            pending: AtomicUsize::new(0),
            served: AtomicU64::new(0),
            sweeper,
        }
    }
}
