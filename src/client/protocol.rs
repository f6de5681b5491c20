//! Connectors that produce the sockets transports run over.
//!
//! Engines hold a connector rather than a socket: a lost connection is
//! re-established by dialling again, and tests substitute connectors that
//! lead to mock servers instead of the network.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::ReadBuf;
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// How often to bind a fresh ephemeral port when the one we drew is taken.
const BIND_RETRIES: usize = 10;

/// A boxed future resolving to a freshly established connection.
pub type ConnectFut<Conn> =
    Pin<Box<dyn Future<Output = Result<Conn, io::Error>> + Send>>;

//------------ AsyncConnect --------------------------------------------------

/// Produces fresh connections towards a fixed remote.
pub trait AsyncConnect {
    /// The type of an established connection.
    type Connection;

    /// The future establishing the connection.
    type Fut: Future<Output = Result<Self::Connection, io::Error>> + Send;

    /// Starts establishing a connection.
    fn connect(&self) -> Self::Fut;
}

//------------ TcpConnect ----------------------------------------------------

/// Dials a TCP server.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnect<Addr> {
    /// The remote address to dial.
    addr: Addr,
}

impl<Addr> TcpConnect<Addr> {
    /// Creates a connector for the given remote address.
    pub fn new(addr: Addr) -> Self {
        Self { addr }
    }
}

impl<Addr> AsyncConnect for TcpConnect<Addr>
where
    Addr: ToSocketAddrs + Clone + Send + Sync + 'static,
{
    type Connection = TcpStream;
    type Fut = ConnectFut<Self::Connection>;

    fn connect(&self) -> Self::Fut {
        Box::pin(TcpStream::connect(self.addr.clone()))
    }
}

//------------ TlsConnect -----------------------------------------------------

/// Dials a TLS server: a TCP connect followed by the handshake.
///
/// The server name is sent as SNI and the certificate chain is validated
/// against the trust store in the client configuration. The connector
/// also carries any SPKI pin material configured for the server; see
/// [`check_spki_pins`] for what currently happens with it.
#[derive(Clone, Debug)]
pub struct TlsConnect<Addr> {
    /// Configuration for setting up a TLS connection.
    client_config: Arc<ClientConfig>,

    /// Server name for SNI and certificate verification.
    server_name: ServerName,

    /// Base64 SPKI fingerprints of acceptable server certificates.
    spki_pins: Arc<[String]>,

    /// The remote address to dial.
    addr: Addr,
}

impl<Addr> TlsConnect<Addr> {
    /// Creates a connector without pin material.
    pub fn new(
        client_config: impl Into<Arc<ClientConfig>>,
        server_name: ServerName,
        addr: Addr,
    ) -> Self {
        Self::with_spki_pins(client_config, server_name, addr, Vec::new())
    }

    /// Creates a connector carrying SPKI pins for the server.
    pub fn with_spki_pins(
        client_config: impl Into<Arc<ClientConfig>>,
        server_name: ServerName,
        addr: Addr,
        spki_pins: Vec<String>,
    ) -> Self {
        Self {
            client_config: client_config.into(),
            server_name,
            spki_pins: spki_pins.into(),
            addr,
        }
    }
}

impl<Addr> AsyncConnect for TlsConnect<Addr>
where
    Addr: ToSocketAddrs + Clone + Send + Sync + 'static,
{
    type Connection = TlsStream<TcpStream>;
    type Fut = ConnectFut<Self::Connection>;

    fn connect(&self) -> Self::Fut {
        let connector = TlsConnector::from(self.client_config.clone());
        let server_name = self.server_name.clone();
        let spki_pins = self.spki_pins.clone();
        let addr = self.addr.clone();
        Box::pin(async move {
            let tcp = TcpStream::connect(addr).await?;
            let stream = connector.connect(server_name, tcp).await?;
            let (_, session) = stream.get_ref();
            check_spki_pins(
                session.peer_certificates().unwrap_or_default(),
                &spki_pins,
            );
            Ok(stream)
        })
    }
}

/// Compares the server certificate chain against the configured pins.
///
/// The fingerprint comparison itself is not implemented: any chain that
/// passed validation is accepted, pins or no pins. Callers must not rely
/// on pinning yet.
fn check_spki_pins(chain: &[Certificate], pins: &[String]) {
    if !pins.is_empty() {
        debug!(
            "{} SPKI pin(s) configured for a chain of {} certificate(s); \
             pin verification is not implemented, accepting",
            pins.len(),
            chain.len()
        );
    }
}

//------------ UdpConnect --------------------------------------------------

/// Dials a UDP server.
///
/// Every connect binds a fresh socket to an ephemeral port of the
/// server's address family before connecting it, so each exchange gets
/// its own unpredictable source port.
#[derive(Clone, Copy, Debug)]
pub struct UdpConnect {
    /// The remote address to dial.
    addr: SocketAddr,
}

impl UdpConnect {
    /// Creates a connector for the given remote address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Binds and connects a socket of the right address family.
    async fn dial(self) -> Result<UdpSocket, io::Error> {
        let wildcard: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut last_err = None;
        for _ in 0..=BIND_RETRIES {
            match UdpSocket::bind(wildcard).await {
                Ok(sock) => {
                    sock.connect(self.addr).await?;
                    return Ok(sock);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.expect("at least one bind attempt was made"))
    }
}

impl AsyncConnect for UdpConnect {
    type Connection = UdpSocket;
    type Fut = ConnectFut<Self::Connection>;

    fn connect(&self) -> Self::Fut {
        Box::pin(self.dial())
    }
}

//------------ AsyncDgramRecv / AsyncDgramSend -------------------------------

/// A socket datagrams can be received from.
pub trait AsyncDgramRecv {
    /// Polled receive of a single datagram.
    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>>;
}

impl AsyncDgramRecv for UdpSocket {
    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        UdpSocket::poll_recv(self, cx, buf)
    }
}

/// A socket datagrams can be sent over.
pub trait AsyncDgramSend {
    /// Polled send of a single datagram.
    fn poll_send(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>>;
}

impl AsyncDgramSend for UdpSocket {
    fn poll_send(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        UdpSocket::poll_send(self, cx, buf)
    }
}

/// Receives a single datagram, returning how many octets arrived.
pub async fn recv_dgram<R: AsyncDgramRecv + ?Sized>(
    sock: &R,
    buf: &mut [u8],
) -> io::Result<usize> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match sock.poll_recv(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Sends a single datagram, returning how many octets went out.
pub async fn send_dgram<S: AsyncDgramSend + ?Sized>(
    sock: &S,
    buf: &[u8],
) -> io::Result<usize> {
    poll_fn(|cx| sock.poll_send(cx, buf)).await
}
