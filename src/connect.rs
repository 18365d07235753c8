use core::{future::Future, sync::atomic::AtomicUsize, sync::atomic::Ordering};

use std::{net::ToSocketAddrs, sync::Arc};

use futures_core::future::BoxFuture;
use tokio::net::TcpStream;

use crate::{
    connection::ConnStream,
    error::{Error, ResolveError},
};

/// Trait for custom transport dialers. `addr` is a single `host[:port]` entry
/// taken from the configured address list.
///
/// # Examples
/// ```rust
/// use fleethttp::{error::Error, ConnStream, Dial, HostClient};
///
/// struct MyDialer;
///
/// impl Dial for MyDialer {
///     async fn dial(&self, addr: &str) -> Result<ConnStream, Error> {
///         // transport setup logic producing an AsyncRead + AsyncWrite stream.
///         todo!()
///     }
/// }
///
/// # fn build() {
/// let client = HostClient::builder("localhost:8080").dial(MyDialer).finish();
/// # }
/// ```
pub trait Dial: Send + Sync {
    fn dial(&self, addr: &str) -> impl Future<Output = Result<ConnStream, Error>> + Send;
}

pub(crate) trait DialDyn: Send + Sync {
    fn dial_dyn<'s, 'a>(&'s self, addr: &'a str) -> BoxFuture<'a, Result<ConnStream, Error>>
    where
        's: 'a;
}

impl<D> DialDyn for D
where
    D: Dial,
{
    #[inline]
    fn dial_dyn<'s, 'a>(&'s self, addr: &'a str) -> BoxFuture<'a, Result<ConnStream, Error>>
    where
        's: 'a,
    {
        Box::pin(self.dial(addr))
    }
}

pub(crate) type Dialer = Arc<dyn DialDyn>;

pub(crate) fn default_dialer() -> Dialer {
    Arc::new(TcpDialer)
}

/// default dialer: blocking dns resolve off the runtime, then try every
/// resolved address in order and keep the last error when all fail.
struct TcpDialer;

impl Dial for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<ConnStream, Error> {
        let host = addr.to_string();
        let addrs = tokio::task::spawn_blocking(move || host.to_socket_addrs())
            .await
            .map_err(|e| Error::Std(Box::new(e)))?
            .map_err(Error::Dial)?;

        let mut last_err = None;

        for resolved in addrs {
            match TcpStream::connect(resolved).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(ConnStream::from(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => Error::Dial(e),
            None => ResolveError::new(addr).into(),
        })
    }
}

/// ordered transport addresses for one origin, derived by splitting the
/// configured `addr` string on commas. entries without an explicit port get
/// the scheme default appended once, up front.
pub(crate) struct AddrList {
    addrs: Box<[String]>,
    next: AtomicUsize,
}

impl AddrList {
    pub(crate) fn new(addr: &str, default_port: u16) -> Self {
        let addrs = addr
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| join_default_port(a, default_port))
            .collect::<Vec<_>>();

        Self {
            addrs: addrs.into_boxed_slice(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// round robin pick. wrapping add keeps the cursor fair across callers.
    pub(crate) fn next(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        &self.addrs[idx % self.addrs.len()]
    }
}

pub(crate) fn host_part(addr: &str) -> &str {
    // ipv6 literals keep their brackets out of the port split.
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(addr);
    }
    addr.split(':').next().unwrap_or(addr)
}

fn join_default_port(addr: &str, default_port: u16) -> String {
    let has_port = if addr.starts_with('[') {
        addr.rsplit(']').next().is_some_and(|p| p.starts_with(':'))
    } else {
        addr.contains(':')
    };

    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    }
}
