use core::time::Duration;

use std::sync::Mutex;

use tokio::{sync::Notify, time::Instant};

use crate::{connection::PooledConn, error::Error, timeout::Timer};

/// per host idle pool plus the open connection budget.
///
/// `open` counts idle, checked out and currently dialing connections, so
/// `idle.len() + active <= max_conns` holds at all times. the mutex is held
/// for O(1) bookkeeping only, never across io. waiters for a free slot or a
/// returned connection park on the notify.
pub(crate) struct ConnPool {
    max_conns: usize,
    max_idle: Duration,
    inner: Mutex<PoolInner>,
    notify: Notify,
}

struct PoolInner {
    /// most recently released at the tail. acquire pops the tail for socket
    /// buffer warmth, so stale connections drain at the head.
    idle: Vec<PooledConn>,
    open: usize,
}

pub(crate) enum Acquired<'p> {
    Conn(ConnGuard<'p>),
    /// no reusable connection; the caller owns one admission slot and must
    /// dial. dropping the permit without fulfilling it gives the slot back.
    Permit(DialPermit<'p>),
}

impl ConnPool {
    pub(crate) fn new(max_conns: usize, max_idle: Duration) -> Self {
        Self {
            max_conns,
            max_idle,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                open: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn try_acquire(&self) -> Result<Acquired<'_>, Error> {
        let mut stale = Vec::new();

        let res = {
            let mut inner = self.inner.lock().unwrap();

            loop {
                match inner.idle.pop() {
                    Some(conn) if conn.expired(self.max_idle) => {
                        inner.open -= 1;
                        stale.push(conn);
                    }
                    Some(mut conn) => {
                        conn.reused = true;
                        break Ok(Acquired::Conn(ConnGuard {
                            pool: self,
                            conn: Some(conn),
                            reuse: true,
                        }));
                    }
                    None => {
                        if inner.open < self.max_conns {
                            inner.open += 1;
                            break Ok(Acquired::Permit(DialPermit {
                                pool: self,
                                fulfilled: false,
                            }));
                        }
                        break Err(Error::NoFreeConnections);
                    }
                }
            }
        };

        // discarded sockets close outside the lock; each freed slot may admit
        // a waiter.
        for _ in &stale {
            self.notify.notify_one();
        }
        drop(stale);

        res
    }

    /// acquire, parking on release signals until the deadline. expiry of the
    /// wait surfaces as [Error::NoFreeConnections]: the condition is still the
    /// transient per-host limit, and callers are expected to retry.
    pub(crate) async fn acquire_wait(&self, timer: &mut Timer) -> Result<Acquired<'_>, Error> {
        loop {
            match self.try_acquire() {
                Ok(acquired) => return Ok(acquired),
                Err(Error::NoFreeConnections) => {}
                Err(e) => return Err(e),
            }

            if timer.bound(self.notify.notified()).await.is_err() {
                return Err(Error::NoFreeConnections);
            }
        }
    }

    /// close idle connections past the idle threshold. runs off the host
    /// sweeper task; acquire performs the same check on its own path.
    pub(crate) fn sweep_idle(&self) {
        if self.max_idle.is_zero() {
            return;
        }

        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            let max_idle = self.max_idle;
            let (stale, fresh) = inner
                .idle
                .drain(..)
                .partition::<Vec<_>, _>(|c| c.expired(max_idle));
            inner.idle = fresh;
            inner.open -= stale.len();
            stale
        };

        for _ in &dropped {
            self.notify.notify_one();
        }
        drop(dropped);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.inner.lock().unwrap().open
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    fn release(&self, mut conn: PooledConn) {
        conn.idle_since = Instant::now();
        self.inner.lock().unwrap().idle.push(conn);
        self.notify.notify_one();
    }

    fn close_one(&self) {
        self.inner.lock().unwrap().open -= 1;
        self.notify.notify_one();
    }
}

/// exclusive handle to a checked out connection. exactly one of two exits:
/// back into the pool, or closed with its slot given back.
pub(crate) struct ConnGuard<'p> {
    pool: &'p ConnPool,
    conn: Option<PooledConn>,
    reuse: bool,
}

impl ConnGuard<'_> {
    pub(crate) fn conn_mut(&mut self) -> &mut PooledConn {
        self.conn.as_mut().expect("connection taken before drop")
    }

    pub(crate) fn conn(&self) -> &PooledConn {
        self.conn.as_ref().expect("connection taken before drop")
    }

    pub(crate) fn destroy_on_drop(&mut self) {
        self.reuse = false;
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.reuse {
                self.pool.release(conn);
            } else {
                drop(conn);
                self.pool.close_one();
            }
        }
    }
}

pub(crate) struct DialPermit<'p> {
    pool: &'p ConnPool,
    fulfilled: bool,
}

impl<'p> DialPermit<'p> {
    pub(crate) fn fulfill(mut self, conn: PooledConn) -> ConnGuard<'p> {
        self.fulfilled = true;
        ConnGuard {
            pool: self.pool,
            conn: Some(conn),
            reuse: true,
        }
    }
}

impl Drop for DialPermit<'_> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.pool.close_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::net::TcpStream;

    use crate::connection::ConnStream;

    use super::*;

    async fn test_conn() -> PooledConn {
        // a real socket pair so drops actually close something.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        PooledConn::new(ConnStream::from(client.unwrap()), 4096)
    }

    #[tokio::test]
    async fn acquire_hands_out_permit_then_pools() {
        let pool = ConnPool::new(2, Duration::from_secs(10));

        let permit = match pool.try_acquire().unwrap() {
            Acquired::Permit(p) => p,
            Acquired::Conn(_) => panic!("empty pool cannot hand out a connection"),
        };
        assert_eq!(pool.open_count(), 1);

        let guard = permit.fulfill(test_conn().await);
        drop(guard);

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.open_count(), 1);

        match pool.try_acquire().unwrap() {
            Acquired::Conn(c) => assert!(c.conn().reused),
            Acquired::Permit(_) => panic!("idle connection must be preferred"),
        };
    }

    #[tokio::test]
    async fn lifo_order() {
        let pool = ConnPool::new(4, Duration::from_secs(10));

        // park two connections, marking them through the read buffer.
        for tag in [b'a', b'b'] {
            let Acquired::Permit(p) = pool.try_acquire().unwrap() else {
                panic!()
            };
            let mut conn = test_conn().await;
            conn.read_buf = BytesMut::from(&[tag][..]);
            drop(p.fulfill(conn));
        }

        let Acquired::Conn(first) = pool.try_acquire().unwrap() else {
            panic!()
        };
        // most recently released comes back first.
        assert_eq!(&first.conn().read_buf[..], b"b");
    }

    #[tokio::test]
    async fn limit_enforced_and_slot_returned() {
        let pool = ConnPool::new(1, Duration::from_secs(10));

        let Acquired::Permit(permit) = pool.try_acquire().unwrap() else {
            panic!()
        };
        assert!(matches!(
            pool.try_acquire(),
            Err(Error::NoFreeConnections)
        ));

        // dial failure path: dropping the permit frees the slot.
        drop(permit);
        assert_eq!(pool.open_count(), 0);
        assert!(matches!(pool.try_acquire(), Ok(Acquired::Permit(_))));
    }

    #[tokio::test]
    async fn destroyed_connection_frees_its_slot() {
        let pool = ConnPool::new(1, Duration::from_secs(10));

        let Acquired::Permit(permit) = pool.try_acquire().unwrap() else {
            panic!()
        };
        let mut guard = permit.fulfill(test_conn().await);
        guard.destroy_on_drop();
        drop(guard);

        assert_eq!(pool.open_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        use std::sync::Arc;

        let pool = Arc::new(ConnPool::new(1, Duration::from_secs(10)));

        let Acquired::Permit(permit) = pool.try_acquire().unwrap() else {
            panic!()
        };
        let guard = permit.fulfill(test_conn().await);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut timer =
                    Timer::deadline(Instant::now() + Duration::from_secs(5));
                match pool.acquire_wait(&mut timer).await {
                    Ok(Acquired::Conn(c)) => c.conn().reused,
                    _ => false,
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_deadline_surfaces_no_free_connections() {
        let pool = ConnPool::new(1, Duration::from_secs(10));

        let Acquired::Permit(_permit) = pool.try_acquire().unwrap() else {
            panic!()
        };

        let mut timer = Timer::deadline(Instant::now() + Duration::from_millis(20));
        assert!(matches!(
            pool.acquire_wait(&mut timer).await,
            Err(Error::NoFreeConnections)
        ));
    }

    #[tokio::test]
    async fn sweep_closes_stale_idles() {
        tokio::time::pause();

        let pool = ConnPool::new(4, Duration::from_millis(50));
        let Acquired::Permit(p) = pool.try_acquire().unwrap() else {
            panic!()
        };
        drop(p.fulfill(test_conn().await));
        assert_eq!(pool.idle_count(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        pool.sweep_idle();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.open_count(), 0);
    }
}
