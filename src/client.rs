use core::time::Duration;

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, RwLock},
};

use bytes::Bytes;
use http::{header::LOCATION, Method, Uri};
use tokio::{task::JoinHandle, time::Instant};
use tracing::trace;

use crate::{
    builder::ClientBuilder,
    connect::Dialer,
    error::{Error, InvalidUri, ParseError},
    host::HostClient,
    tls::Connector,
    Request, Response,
};

const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// http client multiplexing requests over per origin [HostClient]s.
///
/// The registry of host clients grows on demand and is garbage collected by a
/// background sweeper: entries that served nothing over a sweep interval and
/// hold no connections are dropped.
///
/// # Examples
/// ```rust,no_run
/// use fleethttp::Client;
///
/// # async fn _main() -> Result<(), fleethttp::error::Error> {
/// let client = Client::new();
/// let res = client.get("http://example.com/").await?;
/// println!("{}", String::from_utf8_lossy(res.body()));
/// # Ok(())
/// # }
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct ClientInner {
    pub(crate) hosts: RwLock<HashMap<String, Arc<HostClient>>>,
    pub(crate) dialer: Option<Dialer>,
    pub(crate) connector: Arc<Connector>,
    pub(crate) host_template: HostTemplate,
    pub(crate) sweeper: OnceLock<JoinHandle<()>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get() {
            handle.abort();
        }
    }
}

/// per host limits a [Client] hands down to the host clients it creates.
pub(crate) struct HostTemplate {
    pub(crate) max_conns_per_host: usize,
    pub(crate) max_idle_conn_duration: Duration,
    pub(crate) max_conn_duration: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) max_response_body_size: usize,
    pub(crate) max_retry_count: usize,
}

impl Client {
    /// Construct a new Client with default settings.
    ///
    /// Must be called within a tokio runtime: the registry sweeper task is
    /// spawned here.
    pub fn new() -> Self {
        Self::builder().finish()
    }

    /// Start a new [ClientBuilder] with customizable configuration.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        let inner = Arc::new(inner);

        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            // first tick completes immediately; skip it so the first real
            // sweep happens one full period in.
            interval.tick().await;
            let mut last_served: HashMap<String, u64> = HashMap::new();
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let mut hosts = inner.hosts.write().unwrap();
                hosts.retain(|key, host| {
                    let served = host.served_count();
                    let prev = last_served.insert(key.clone(), served);
                    let unused = prev == Some(served)
                        && host.pending_requests() == 0
                        && host.open_connections() == 0;
                    if unused {
                        trace!(%key, "removing unused host client");
                    }
                    !unused
                });
                last_served.retain(|key, _| hosts.contains_key(key));
            }
        });

        let _ = inner.sweeper.set(handle);

        Self { inner }
    }

    /// Send the request to the origin its uri names. The uri must be
    /// absolute: scheme and authority select the host client.
    pub async fn send(&self, req: Request) -> Result<Response, Error> {
        self.host_client(req.uri())?.send(req).await
    }

    /// [send](Self::send) with `deadline = now + timeout`.
    pub async fn send_timeout(&self, req: Request, timeout: Duration) -> Result<Response, Error> {
        self.host_client(req.uri())?.send_timeout(req, timeout).await
    }

    /// [send](Self::send) with an absolute deadline across all phases.
    pub async fn send_deadline(&self, req: Request, deadline: Instant) -> Result<Response, Error> {
        self.host_client(req.uri())?.send_deadline(req, deadline).await
    }

    /// Convenience GET with empty body.
    pub async fn get(&self, uri: &str) -> Result<Response, Error> {
        self.send(build_request(Method::GET, uri.parse()?, Bytes::new())?).await
    }

    /// Convenience POST.
    pub async fn post(&self, uri: &str, body: impl Into<Bytes>) -> Result<Response, Error> {
        self.send(build_request(Method::POST, uri.parse()?, body.into())?).await
    }

    /// GET following up to `max_redirects` redirect responses. A redirect
    /// without a `location` header is returned as is.
    pub async fn get_following_redirects(
        &self,
        uri: &str,
        max_redirects: usize,
    ) -> Result<Response, Error> {
        let mut uri: Uri = uri.parse()?;
        let mut redirects = 0;

        loop {
            let res = self.send(build_request(Method::GET, uri.clone(), Bytes::new())?).await?;

            if !res.status().is_redirection() {
                return Ok(res);
            }
            let Some(location) = res.headers().get(LOCATION) else {
                return Ok(res);
            };
            if redirects == max_redirects {
                return Err(Error::TooManyRedirects);
            }
            redirects += 1;
            uri = resolve_location(&uri, location.to_str().map_err(|_| ParseError::HeaderValue)?)?;
            trace!(%uri, "following redirect");
        }
    }

    /// Calls currently inside this client, summed over all host clients.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .hosts
            .read()
            .unwrap()
            .values()
            .map(|h| h.pending_requests())
            .sum()
    }

    /// Number of host clients currently in the registry.
    pub fn host_count(&self) -> usize {
        self.inner.hosts.read().unwrap().len()
    }

    fn host_client(&self, uri: &Uri) -> Result<Arc<HostClient>, Error> {
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(_) => return Err(InvalidUri::UnknownScheme.into()),
            None => return Err(InvalidUri::MissingScheme.into()),
        };

        let authority = uri
            .authority()
            .ok_or(InvalidUri::MissingHost)?
            .as_str();

        let key = if tls {
            format!("https-{authority}")
        } else {
            format!("http-{authority}")
        };

        if let Some(host) = self.inner.hosts.read().unwrap().get(&key) {
            return Ok(host.clone());
        }

        let mut hosts = self.inner.hosts.write().unwrap();
        let host = hosts
            .entry(key)
            .or_insert_with(|| Arc::new(self.make_host(authority, tls)))
            .clone();
        Ok(host)
    }

    fn make_host(&self, authority: &str, tls: bool) -> HostClient {
        let t = &self.inner.host_template;

        let mut builder = HostClient::builder(authority)
            .connector_shared(self.inner.connector.clone(), tls)
            .set_max_conns(t.max_conns_per_host)
            .set_max_idle_conn_duration(t.max_idle_conn_duration)
            .set_max_conn_duration(t.max_conn_duration)
            .set_read_timeout(t.read_timeout)
            .set_write_timeout(t.write_timeout)
            .set_read_buffer_size(t.read_buffer_size)
            .set_write_buffer_size(t.write_buffer_size)
            .set_max_response_body_size(t.max_response_body_size)
            .set_max_retry_count(t.max_retry_count);

        if let Some(dialer) = &self.inner.dialer {
            builder = builder.dialer_shared(dialer.clone());
        }

        builder.finish()
    }
}

fn build_request(method: Method, uri: Uri, body: Bytes) -> Result<Request, Error> {
    let mut req = http::Request::new(body);
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    Ok(req)
}

fn resolve_location(base: &Uri, location: &str) -> Result<Uri, Error> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.parse()?);
    }

    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{location}")
    };

    let scheme = base.scheme().cloned().ok_or(InvalidUri::MissingScheme)?;
    let authority = base.authority().cloned().ok_or(InvalidUri::MissingHost)?;

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|e| Error::Std(Box::new(e)))
}
