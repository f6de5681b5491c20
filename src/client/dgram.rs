//! A single DNS request/response exchange over a datagram transport.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::Message;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration, Instant};

use crate::client::protocol::{
    recv_dgram, send_dgram, AsyncConnect, AsyncDgramRecv, AsyncDgramSend,
};
use crate::client::request::{is_answer, ComposeRequest, Error};

/// Default configuration value for the maximum number of parallel DNS
/// queries over a single datagram transport connection.
const DEF_MAX_PARALLEL: usize = 100;

/// Minimum configuration value for max_parallel.
const MIN_MAX_PARALLEL: usize = 1;

/// Maximum configuration value for max_parallel.
const MAX_MAX_PARALLEL: usize = 1000;

/// Default configuration value for the maximum amount of time to wait for a
/// reply.
const DEF_READ_TIMEOUT: Duration = Duration::from_secs(4);

/// Maximum configuration value for read_timeout.
const MAX_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Size of the buffer datagrams are received into.
const RECV_SIZE: usize = 2000;

//------------ Config ---------------------------------------------------------

/// Configuration for a datagram transport connection.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of parallel requests for a transport connection.
    max_parallel: usize,

    /// Read timeout.
    read_timeout: Duration,

    /// EDNS(0) UDP payload size to advertise.
    ///
    /// When this is `None` the request is sent exactly as composed by the
    /// caller, OPT record and all.
    udp_payload_size: Option<u16>,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the maximum number of parallel requests.
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Sets the maximum number of parallel requests.
    ///
    /// Out-of-range values are quietly trimmed.
    pub fn set_max_parallel(&mut self, value: usize) {
        self.max_parallel = value.clamp(MIN_MAX_PARALLEL, MAX_MAX_PARALLEL)
    }

    /// Returns the read timeout.
    ///
    /// The time to wait for a matching response to a request that has been
    /// sent.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Sets the read timeout.
    ///
    /// Excessive values are quietly trimmed. A zero timeout is allowed and
    /// simply makes every exchange time out right after sending.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout.min(MAX_READ_TIMEOUT)
    }

    /// Returns the UDP payload size that will be advertised, if any.
    pub fn udp_payload_size(&self) -> Option<u16> {
        self.udp_payload_size
    }

    /// Sets the UDP payload size to advertise.
    ///
    /// `None` leaves the request untouched.
    pub fn set_udp_payload_size(&mut self, value: Option<u16>) {
        self.udp_payload_size = value
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel: DEF_MAX_PARALLEL,
            read_timeout: DEF_READ_TIMEOUT,
            udp_payload_size: None,
        }
    }
}

//------------ Connection -----------------------------------------------------

/// A datagram transport connection towards a single server.
///
/// Every request opens a fresh socket through the connector, sends the
/// request once and waits for a matching response until the read timeout
/// expires. Datagrams that do not answer the request are ignored. The
/// response is returned as received; in particular a truncated response is
/// not an error here because the caller may want to retry over a stream
/// transport.
#[derive(Clone, Debug)]
pub struct Connection<S> {
    /// Reference to the actual connection object.
    inner: Arc<InnerConnection<S>>,
}

impl<S, C> Connection<S>
where
    S: AsyncConnect<Connection = C> + Clone + Send + Sync + 'static,
    C: AsyncDgramRecv + AsyncDgramSend + Send + Sync + 'static,
{
    /// Create a new datagram transport connection.
    pub fn new(config: Config, connect: S) -> Self {
        Self {
            inner: Arc::new(InnerConnection::new(config, connect)),
        }
    }

    /// Performs a request and returns the response.
    pub async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        self.inner.request(request).await
    }
}

//------------ InnerConnection ------------------------------------------------

/// Actual implementation of the datagram transport connection.
#[derive(Debug)]
struct InnerConnection<S> {
    /// User configuration variables.
    config: Config,

    /// Connector producing datagram sockets.
    connect: S,

    /// Semaphore to limit the number of concurrently open sockets.
    semaphore: Arc<Semaphore>,
}

impl<S, C> InnerConnection<S>
where
    S: AsyncConnect<Connection = C> + Clone + Send + Sync + 'static,
    C: AsyncDgramRecv + AsyncDgramSend + Send + Sync + 'static,
{
    /// Create new InnerConnection object.
    fn new(config: Config, connect: S) -> Self {
        let max_parallel = config.max_parallel;
        Self {
            config,
            connect,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
        }
    }

    /// Performs a request and waits for a matching response.
    async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        let _permit = self.get_permit().await;

        let sock = self
            .connect
            .connect()
            .await
            .map_err(|e| Error::UdpConnect(Arc::new(e)))?;

        let mut request = request.clone();
        if let Some(size) = self.config.udp_payload_size {
            request.set_udp_payload_size(size);
        }
        let request_msg = request.to_message()?;
        let dgram = request_msg.as_slice();

        let sent = send_dgram(&sock, dgram)
            .await
            .map_err(|e| Error::UdpSend(Arc::new(e)))?;
        if sent != dgram.len() {
            return Err(Error::UdpShortSend);
        }

        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.config.read_timeout {
                return Err(Error::RequestTimedOut);
            }
            let remain = self.config.read_timeout - elapsed;

            let mut buf = vec![0; RECV_SIZE];
            let len = match timeout(remain, recv_dgram(&sock, &mut buf)).await
            {
                Err(_) => return Err(Error::RequestTimedOut),
                Ok(res) => {
                    res.map_err(|e| Error::UdpReceive(Arc::new(e)))?
                }
            };
            buf.truncate(len);

            // There is a deadline on the whole exchange, so garbage is
            // simply ignored and we go back to receiving.
            let answer = match Message::from_octets(Bytes::from(buf)) {
                Ok(answer) => answer,
                Err(_) => continue,
            };

            if !is_answer(&answer, &request_msg) {
                continue;
            }
            return Ok(answer);
        }
    }

    /// Returns a permit from the socket semaphore.
    async fn get_permit(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("the semaphore has not been closed")
    }
}

//============ Tests =========================================================
