//! Classic DNS: UDP with fallback to TCP, over a list of servers.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::Message;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::client::dgram;
use crate::client::protocol::UdpConnect;
use crate::client::request::{
    check_response, is_answer, ComposeRequest, Error,
};

/// The DNS port.
const DNS_PORT: u16 = 53;

/// Default deadline for the TCP leg of a query.
const DEF_TCP_TIMEOUT: Duration = Duration::from_secs(4);

//------------ Config ---------------------------------------------------------

/// Configuration for a Do53 transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// Configuration of the UDP leg.
    udp: dgram::Config,

    /// Deadline for the TCP leg, covering connect, send and receive.
    ///
    /// The TCP leg gets this budget in full; time spent on the UDP leg
    /// does not count against it.
    tcp_timeout: Duration,

    /// Whether responses with a non-NOERROR status are errors.
    strict_rcode: bool,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the configuration of the UDP leg.
    pub fn udp(&self) -> &dgram::Config {
        &self.udp
    }

    /// Returns a mutable reference to the UDP leg configuration.
    pub fn udp_mut(&mut self) -> &mut dgram::Config {
        &mut self.udp
    }

    /// Returns the TCP deadline.
    pub fn tcp_timeout(&self) -> Duration {
        self.tcp_timeout
    }

    /// Sets the TCP deadline.
    pub fn set_tcp_timeout(&mut self, timeout: Duration) {
        self.tcp_timeout = timeout
    }

    /// Returns whether error statuses are raised as errors.
    pub fn strict_rcode(&self) -> bool {
        self.strict_rcode
    }

    /// Sets whether error statuses are raised as errors.
    ///
    /// When disabled, a response reporting for instance NXDOMAIN is
    /// returned to the caller as a response. Transport failures are
    /// errors either way.
    pub fn set_strict_rcode(&mut self, strict: bool) {
        self.strict_rcode = strict
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: Default::default(),
            tcp_timeout: DEF_TCP_TIMEOUT,
            strict_rcode: true,
        }
    }
}

//------------ Connection -----------------------------------------------------

/// A Do53 transport over a list of candidate servers.
///
/// A request walks the server list in order. For each server the request
/// first goes out over UDP; a truncated response or a UDP timeout promotes
/// the request to TCP towards the same server. Any other failure moves on
/// to the next server. Only when every server has been tried without a
/// usable response does the request fail.
///
/// No state is kept between requests: every attempt uses fresh sockets and
/// the caller's message is sent as composed, message ID included.
#[derive(Clone, Debug)]
pub struct Connection {
    /// User configuration.
    config: Config,

    /// The candidate servers in the order they are tried.
    servers: Arc<[SocketAddr]>,
}

impl Connection {
    /// Creates a new Do53 transport with default configuration.
    pub fn new(servers: impl IntoIterator<Item = IpAddr>) -> Self {
        Self::with_config(servers, Default::default())
    }

    /// Creates a transport towards the platform's configured servers.
    ///
    /// The server list comes from [`conf::system_server_addrs`], filtered
    /// and ordered by [`conf::filter_available`].
    ///
    /// [`conf::system_server_addrs`]: crate::conf::system_server_addrs
    /// [`conf::filter_available`]: crate::conf::filter_available
    pub fn from_system_servers() -> Self {
        Self::new(crate::conf::filter_available(
            crate::conf::system_server_addrs(),
        ))
    }

    /// Creates a new Do53 transport with the given configuration.
    pub fn with_config(
        servers: impl IntoIterator<Item = IpAddr>,
        config: Config,
    ) -> Self {
        Self::from_socket_addrs(
            servers
                .into_iter()
                .map(|addr| SocketAddr::new(addr, DNS_PORT)),
            config,
        )
    }

    /// Creates a new Do53 transport towards explicit socket addresses.
    ///
    /// This is for servers that do not listen on the well-known port;
    /// [`Self::with_config`] is the common case.
    pub fn from_socket_addrs(
        servers: impl IntoIterator<Item = SocketAddr>,
        config: Config,
    ) -> Self {
        Self {
            config,
            servers: servers.into_iter().collect(),
        }
    }

    /// Returns the candidate servers in the order they are tried.
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Performs a request and returns the response.
    pub async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        if self.servers.is_empty() {
            return Err(Error::NoServers);
        }

        for &server in self.servers.iter() {
            let udp = dgram::Connection::new(
                self.config.udp.clone(),
                UdpConnect::new(server),
            );
            match udp.request(request).await {
                Ok(answer) => {
                    if !answer.header().tc() {
                        check_response(
                            &answer,
                            false,
                            self.config.strict_rcode,
                        )?;
                        return Ok(answer);
                    }
                    debug!(
                        "truncated UDP response from {}, retrying over TCP",
                        server
                    );
                }
                Err(Error::RequestTimedOut) => {
                    // No UDP response in time. The server may simply not
                    // do UDP towards us; give TCP a chance.
                    debug!(
                        "UDP request to {} timed out, retrying over TCP",
                        server
                    );
                }
                Err(err) => {
                    debug!("request to {} failed: {}", server, err);
                    continue;
                }
            }

            match self.tcp_request(server, request).await {
                Ok(answer) => {
                    check_response(&answer, true, self.config.strict_rcode)?;
                    return Ok(answer);
                }
                Err(err) => {
                    debug!("TCP request to {} failed: {}", server, err);
                    continue;
                }
            }
        }

        Err(Error::NoTransportAvailable)
    }

    /// Performs the request over a short-lived TCP connection.
    async fn tcp_request<CR: ComposeRequest + Clone>(
        &self,
        server: SocketAddr,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        match timeout(
            self.config.tcp_timeout,
            Self::tcp_request_impl(server, request),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::RequestTimedOut),
        }
    }

    /// The TCP exchange without its deadline.
    async fn tcp_request_impl<CR: ComposeRequest + Clone>(
        server: SocketAddr,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        let request_msg = request.to_message()?;
        let slice = request_msg.as_slice();
        let len = u16::try_from(slice.len())
            .map_err(|_| Error::StreamLongMessage)?;

        let mut stream = TcpStream::connect(server)
            .await
            .map_err(|e| Error::Connect(Arc::new(e)))?;

        let mut frame = Vec::with_capacity(2 + slice.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(slice);
        stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::StreamWriteError(Arc::new(e)))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::StreamWriteError(Arc::new(e)))?;

        let len = stream
            .read_u16()
            .await
            .map_err(|e| Error::StreamReadError(Arc::new(e)))?
            as usize;
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| Error::StreamReadError(Arc::new(e)))?;

        let answer = Message::from_octets(Bytes::from(buf))
            .map_err(|_| Error::ShortMessage)?;
        if !is_answer(&answer, &request_msg) {
            return Err(Error::WrongReplyForQuery);
        }
        Ok(answer)
    }
}
