use core::time::Duration;

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, RwLock},
};

use crate::{
    client::{Client, ClientInner, HostTemplate},
    connect::{Dial, Dialer},
    tls::{Connector, TlsConnect},
};

/// Builder type for [Client]. Offers configuration before a client instance
/// is created.
pub struct ClientBuilder {
    dialer: Option<Dialer>,
    connector: Connector,
    max_conns_per_host: usize,
    max_idle_conn_duration: Duration,
    max_conn_duration: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    read_buffer_size: usize,
    write_buffer_size: usize,
    max_response_body_size: usize,
    max_retry_count: usize,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            dialer: None,
            connector: Connector::Nop,
            max_conns_per_host: 512,
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

    /// Use a custom transport dialer for every host client this client
    /// creates. The default dialer resolves and connects over tcp.
    pub fn dial<D>(mut self, dialer: D) -> Self
    where
        D: Dial + 'static,
    {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    #[cfg(feature = "rustls")]
    /// enable rustls as tls connector.
    pub fn rustls(mut self) -> Self {
        self.connector = Connector::rustls();
        self
    }

    /// Use a custom tls connector for handshaking with https origins.
    pub fn tls_connector<T>(mut self, connector: T) -> Self
    where
        T: TlsConnect + 'static,
    {
        self.connector = Connector::custom(connector);
        self
    }

    /// Maximum open connections per origin.
    ///
    /// Default to 512.
    pub fn set_max_conns_per_host(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.max_conns_per_host = max;
        self
    }

    /// Close idle connections after this long. Zero disables the limit.
    ///
    /// Default to 10 seconds.
    pub fn set_max_idle_conn_duration(mut self, dur: Duration) -> Self {
        self.max_idle_conn_duration = dur;
        self
    }

    /// Lifetime cap per connection. Zero disables the limit.
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

    /// Finish the builder and construct a [Client] instance.
    ///
    /// Must be called within a tokio runtime: the registry sweeper task is
    /// spawned here.
    pub fn finish(self) -> Client {
        Client::from_inner(ClientInner {
            hosts: RwLock::new(HashMap::new()),
            dialer: self.dialer,
            connector: Arc::new(self.connector),
            host_template: HostTemplate {
                max_conns_per_host: self.max_conns_per_host,
                max_idle_conn_duration: self.max_idle_conn_duration,
                max_conn_duration: self.max_conn_duration,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                read_buffer_size: self.read_buffer_size,
                write_buffer_size: self.write_buffer_size,
                max_response_body_size: self.max_response_body_size,
                max_retry_count: self.max_retry_count,
            },
            sweeper: OnceLock::new(),
        })
    }
}
