use core::future::Future;

use futures_core::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{connection::Io, error::Error};

/// Connector for tls connections.
///
/// All connections to tls origins are passed through the connector. The
/// default [Connector::Nop] refuses them: enabling the `rustls` feature (or
/// installing a custom connector) is what turns https on.
pub enum Connector {
    Nop,
    Custom(Box<dyn TlsConnectDyn>),
}

impl Default for Connector {
    fn default() -> Self {
        Self::Nop
    }
}

impl Connector {
    #[cfg(feature = "rustls")]
    pub(crate) fn rustls() -> Self {
        use std::sync::Arc;

        use tokio_rustls::{rustls::ClientConfig, rustls::RootCertStore, TlsConnector};

        let mut root_certs = RootCertStore::empty();
        root_certs.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_certs)
            .with_no_client_auth();

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self::custom(TlsConnector::from(Arc::new(config)))
    }

    pub(crate) fn custom(connector: impl TlsConnect + 'static) -> Self {
        Self::Custom(Box::new(connector))
    }

    pub(crate) async fn connect<S>(&self, stream: S, domain: &str) -> Result<Box<dyn Io>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match *self {
            Self::Nop => Err(Error::TlsNotEnabled),
            Self::Custom(ref connector) => connector.connect_dyn(domain, Box::new(stream)).await,
        }
    }
}

/// Trait for custom tls connector.
///
/// # Examples
/// ```rust
/// use fleethttp::{error::Error, ClientBuilder, Io, TlsConnect};
///
/// struct MyConnector;
///
/// impl TlsConnect for MyConnector {
///     async fn connect(&self, domain: &str, io: Box<dyn Io>) -> Result<Box<dyn Io>, Error> {
///         // tls handshake logic
///         todo!()
///     }
/// }
///
/// # fn build() {
/// let client = ClientBuilder::new().tls_connector(MyConnector).finish();
/// # }
/// ```
pub trait TlsConnect: Send + Sync {
    /// `Box<dyn Io>` is an async read/write type. See [Io] trait for detail.
    ///
    /// [Io]: crate::Io
    fn connect(&self, domain: &str, io: Box<dyn Io>) -> impl Future<Output = ConnectResult> + Send;
}

type ConnectResult = Result<Box<dyn Io>, Error>;

pub trait TlsConnectDyn: Send + Sync {
    fn connect_dyn<'s, 'd>(&'s self, domain: &'d str, io: Box<dyn Io>) -> BoxFuture<'d, ConnectResult>
    where
        's: 'd;
}

impl<T> TlsConnectDyn for T
where
    T: TlsConnect,
{
    #[inline]
    fn connect_dyn<'s, 'd>(&'s self, domain: &'d str, io: Box<dyn Io>) -> BoxFuture<'d, ConnectResult>
    where
        's: 'd,
    {
        Box::pin(self.connect(domain, io))
    }
}

#[cfg(feature = "rustls")]
impl TlsConnect for tokio_rustls::TlsConnector {
    async fn connect(&self, domain: &str, io: Box<dyn Io>) -> ConnectResult {
        use tokio_rustls::rustls::pki_types::ServerName;

        use crate::error::RustlsError;

        let name = ServerName::try_from(domain.to_owned())
            .map_err(|_| RustlsError::InvalidDnsName)?;
        let stream = tokio_rustls::TlsConnector::connect(self, name, io)
            .await
            .map_err(RustlsError::Io)?;

        Ok(Box::new(stream))
    }
}
