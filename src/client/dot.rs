//! DNS over TLS: multiplexing requests over one encrypted connection.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

// RFC 7858 describes DNS over TLS.

use bytes::Bytes;
use domain::base::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tracing::debug;

use crate::client::protocol::{AsyncConnect, TlsConnect};
use crate::client::request::{check_response, ComposeRequest, Error};
use crate::client::stream;
use crate::conf::DotServer;

/// Default deadline for a query, covering connect, send and receive.
const DEF_TIMEOUT: Duration = Duration::from_secs(4);

//------------ Config ---------------------------------------------------------

/// Configuration for a DNS-over-TLS transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// Deadline for a single query.
    timeout: Duration,

    /// Configuration of the underlying stream connection.
    stream: stream::Config,

    /// Whether responses with a non-NOERROR status are errors.
    strict_rcode: bool,
}

impl Config {
    /// Creates a new, default config.
    ///
    /// The default requests keepalive and pads frames, as an encrypted
    /// transport should.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the query deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the query deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout
    }

    /// Returns the underlying stream configuration.
    pub fn stream(&self) -> &stream::Config {
        &self.stream
    }

    /// Returns a mutable reference to the stream configuration.
    pub fn stream_mut(&mut self) -> &mut stream::Config {
        &mut self.stream
    }

    /// Returns whether error statuses are raised as errors.
    pub fn strict_rcode(&self) -> bool {
        self.strict_rcode
    }

    /// Sets whether error statuses are raised as errors.
    pub fn set_strict_rcode(&mut self, strict: bool) {
        self.strict_rcode = strict
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEF_TIMEOUT,
            stream: stream::Config::new_encrypted(),
            strict_rcode: true,
        }
    }
}

//------------ Connection -----------------------------------------------------

/// A DNS-over-TLS transport.
///
/// The transport keeps at most one live connection. It is established
/// lazily on the first request by trying the configured endpoints in
/// order, and re-established the same way after it breaks. Requests
/// arriving while another request is already connecting wait for that
/// attempt and share its outcome.
///
/// A request that runs into a connection-level failure (typically the
/// server tearing down an idle connection right as we use it) discards
/// the connection and retries exactly once on a fresh one.
pub struct Connection<Remote: AsyncConnect> {
    /// Reference to the actual connection object.
    inner: Arc<InnerConnection<Remote>>,
}

impl<Remote: AsyncConnect> std::fmt::Debug for Connection<Remote> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<Remote: AsyncConnect> Clone for Connection<Remote> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Connection<TlsConnect<SocketAddr>> {
    /// Creates a transport towards the built-in public DoT servers.
    pub fn from_default_servers() -> Result<Self, Error> {
        Self::from_servers(crate::conf::default_dot_servers())
    }

    /// Creates a transport towards the given DoT servers.
    ///
    /// Certificate chains are validated against the platform trust store;
    /// the SNI sent to each server is its configured hostname.
    pub fn from_servers(
        servers: impl IntoIterator<Item = DotServer>,
    ) -> Result<Self, Error> {
        Self::from_servers_with_config(servers, Default::default())
    }

    /// Creates a transport towards the given DoT servers with a config.
    ///
    /// Any SPKI pin material on a server travels with its connector.
    pub fn from_servers_with_config(
        servers: impl IntoIterator<Item = DotServer>,
        config: Config,
    ) -> Result<Self, Error> {
        let client_config = tls_client_config()?;
        let mut remotes = Vec::new();
        for server in servers {
            let server_name = ServerName::try_from(server.hostname())
                .map_err(|_| Error::ConfigError("server name"))?;
            remotes.push(TlsConnect::with_spki_pins(
                client_config.clone(),
                server_name,
                server.socket_addr(),
                server.spki_pins().to_vec(),
            ));
        }
        Ok(Self::with_config(remotes, config))
    }
}

impl<Remote> Connection<Remote>
where
    Remote: AsyncConnect,
    Remote::Connection: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a transport from raw connectors with default configuration.
    ///
    /// This mostly exists so the engine can be driven over other stream
    /// transports, plain TCP included.
    pub fn new(remotes: impl IntoIterator<Item = Remote>) -> Self {
        Self::with_config(remotes, Default::default())
    }

    /// Creates a transport from raw connectors with the given config.
    pub fn with_config(
        remotes: impl IntoIterator<Item = Remote>,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(InnerConnection {
                config,
                remotes: remotes.into_iter().collect(),
                current: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Performs a request and returns the response.
    pub async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        match timeout(
            self.inner.config.timeout,
            self.inner.request(request),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::RequestTimedOut),
        }
    }
}

//------------ InnerConnection ------------------------------------------------

/// Actual implementation of the DNS-over-TLS transport.
struct InnerConnection<Remote: AsyncConnect> {
    /// User configuration.
    config: Config,

    /// The candidate connectors in the order they are tried.
    remotes: Vec<Remote>,

    /// The live connection, if there is one.
    ///
    /// The mutex doubles as the establishment lock: at most one endpoint
    /// sweep runs at a time and everybody else awaits its outcome.
    current: tokio::sync::Mutex<Option<stream::Connection<Remote::Connection>>>,
}

impl<Remote> InnerConnection<Remote>
where
    Remote: AsyncConnect,
    Remote::Connection: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Performs a request, reconnecting and retrying once if the
    /// connection fails underneath it.
    async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        let mut retried = false;
        loop {
            let conn = self.get_conn().await?;
            match conn.request(request).await {
                Ok(answer) => {
                    check_response(
                        &answer,
                        true,
                        self.config.strict_rcode,
                    )?;
                    return Ok(answer);
                }
                Err(err) if is_connection_fault(&err) => {
                    self.invalidate().await;
                    if retried {
                        return Err(err);
                    }
                    debug!(
                        "connection failed mid-request, reconnecting: {}",
                        err
                    );
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the live connection, establishing one if necessary.
    async fn get_conn(
        &self,
    ) -> Result<stream::Connection<Remote::Connection>, Error> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let conn = self.connect_any().await?;
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the live connection if it is no longer usable.
    async fn invalidate(&self) {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.is_closed() {
                *current = None;
            }
        }
    }

    /// Tries the endpoints in order until one produces a connection.
    async fn connect_any(
        &self,
    ) -> Result<stream::Connection<Remote::Connection>, Error> {
        if self.remotes.is_empty() {
            return Err(Error::NoServers);
        }
        for remote in &self.remotes {
            match remote.connect().await {
                Ok(sock) => {
                    let (conn, transport) = stream::Connection::with_config(
                        sock,
                        self.config.stream.clone(),
                    );
                    tokio::spawn(transport.run());
                    return Ok(conn);
                }
                Err(err) => {
                    debug!("connect failed: {}", err);
                }
            }
        }
        Err(Error::NoTransportAvailable)
    }
}

//------------ Utility --------------------------------------------------------

/// Returns whether an error means the connection itself is gone.
///
/// These are the failures a single reconnect may cure; everything else is
/// about the request and is surfaced unchanged.
fn is_connection_fault(err: &Error) -> bool {
    matches!(
        err,
        Error::ConnectionClosed
            | Error::StreamReadError(_)
            | Error::StreamWriteError(_)
            | Error::StreamUnexpectedEndOfData
            | Error::StreamReceiveError
    )
}

/// Builds the TLS client configuration from the platform trust store.
fn tls_client_config() -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| Error::Connect(Arc::new(e)))?;
    let der_certs: Vec<Vec<u8>> =
        certs.into_iter().map(|cert| cert.0).collect();
    let (_added, _ignored) = roots.add_parsable_certificates(&der_certs);
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
