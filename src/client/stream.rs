//! A client transport multiplexing requests over a stream socket.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

// RFC 7766 describes DNS over TCP
// RFC 7828 describes the edns-tcp-keepalive option
// RFC 7830 describes the padding option

use bytes::Bytes;
use domain::base::opt::keepalive::IdleTimeout;
use domain::base::opt::{AllOptData, Padding, TcpKeepalive};
use domain::base::{Message, Name};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::client::request::{is_answer_ignore_id, ComposeRequest, Error};

//------------ Configuration Constants ----------------------------------------

/// The smallest frame that can hold a DNS message header.
const MIN_FRAME_LEN: usize = 12;

/// Default block length the padding option rounds frames up to.
const DEF_PADDING_BLOCK: usize = 128;

/// Wire overhead of an empty padding option: option code and option length.
const PADDING_OPT_HEADER: usize = 4;

/// Length of the frame length prefix itself.
const FRAME_PREFIX_LEN: usize = 2;

/// Default idle timeout requested via edns-tcp-keepalive.
const DEF_KEEPALIVE: Duration = Duration::from_secs(120);

//------------ Config ---------------------------------------------------------

/// Configuration for a stream transport connection.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Idle timeout to request through an edns-tcp-keepalive option.
    ///
    /// `None` leaves requests without a keepalive option.
    idle_keepalive: Option<Duration>,

    /// Block length to pad encoded frames up to.
    ///
    /// `None` disables padding.
    padding_block: Option<usize>,
}

impl Config {
    /// Creates a new, default config.
    ///
    /// The default requests neither keepalive nor padding, which is what a
    /// plain TCP fallback connection wants.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a config for an encrypted transport.
    ///
    /// Requests a two minute idle timeout and pads every frame to a
    /// multiple of 128 octets.
    pub fn new_encrypted() -> Self {
        Self {
            idle_keepalive: Some(DEF_KEEPALIVE),
            padding_block: Some(DEF_PADDING_BLOCK),
        }
    }

    /// Returns the requested idle timeout, if any.
    pub fn idle_keepalive(&self) -> Option<Duration> {
        self.idle_keepalive
    }

    /// Sets the idle timeout to request via edns-tcp-keepalive.
    pub fn set_idle_keepalive(&mut self, timeout: Option<Duration>) {
        self.idle_keepalive = timeout
    }

    /// Returns the padding block length, if padding is enabled.
    pub fn padding_block(&self) -> Option<usize> {
        self.padding_block
    }

    /// Sets the padding block length.
    ///
    /// Values below two disable padding: every frame length is trivially a
    /// multiple of one.
    pub fn set_padding_block(&mut self, block: Option<usize>) {
        self.padding_block = block.filter(|&block| block >= 2)
    }
}

//------------ Connection -----------------------------------------------------

/// A connection to a single stream transport.
///
/// The connection multiplexes any number of concurrent requests over the
/// stream it was created from. Requests are correlated to responses through
/// the 16-bit message ID, which the connection rewrites from its own
/// counter. The counter starts at a random value; an ID that is still in
/// flight is never reused because the outstanding-request table detects the
/// collision.
///
/// [`Connection::new`] returns the connection together with a [`Transport`]
/// that drives the read side. The transport future needs to be spawned;
/// the connection is unusable once it terminates.
///
/// Dropping the last clone of a connection fails all outstanding requests
/// with [`Error::ConnectionClosed`] and releases the underlying stream.
#[derive(Debug)]
pub struct Connection<Stream> {
    /// The shared connection state.
    inner: Arc<InnerConnection<Stream>>,
}

impl<Stream> Clone for Connection<Stream> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Stream> Connection<Stream>
where
    Stream: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a new stream transport with default configuration.
    pub fn new(stream: Stream) -> (Self, Transport<Stream>) {
        Self::with_config(stream, Default::default())
    }

    /// Creates a new stream transport with the given configuration.
    pub fn with_config(
        stream: Stream,
        config: Config,
    ) -> (Self, Transport<Stream>) {
        let (read, write) = tokio::io::split(stream);
        let closed = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outstanding: HashMap::new(),
                next_id: rand::random(),
                closed: false,
                send_keepalive: true,
                advertised_idle: None,
            }),
            closed: closed.clone(),
        });
        let transport = Transport {
            read,
            shared: Arc::downgrade(&shared),
            closed,
        };
        let inner = Arc::new(InnerConnection {
            config,
            write: tokio::sync::Mutex::new(write),
            shared,
        });
        (Self { inner }, transport)
    }

    /// Returns whether the connection can no longer take requests.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.state.lock().closed
    }

    /// Returns the idle timeout the server advertised, if any.
    pub fn advertised_idle_timeout(&self) -> Option<Duration> {
        self.inner.shared.state.lock().advertised_idle
    }

    /// Sends a request and returns a handle for awaiting the response.
    ///
    /// The request is written to the stream before this returns. Dropping
    /// the returned handle abandons the request: its table entry is
    /// removed, the connection stays up for everybody else.
    pub async fn send_request<Req: ComposeRequest + Clone>(
        &self,
        request: &Req,
    ) -> Result<Request, Error> {
        self.inner.send_request(request).await
    }

    /// Sends a request and awaits the response.
    pub async fn request<Req: ComposeRequest + Clone>(
        &self,
        request: &Req,
    ) -> Result<Message<Bytes>, Error> {
        self.send_request(request).await?.get_response().await
    }
}

//------------ InnerConnection ------------------------------------------------

/// The write side and shared state of a stream connection.
#[derive(Debug)]
struct InnerConnection<Stream> {
    /// Transport configuration.
    config: Config,

    /// The write half of the stream.
    ///
    /// The mutex serialises writers so frames are emitted atomically. The
    /// reader runs independently off the read half.
    write: tokio::sync::Mutex<WriteHalf<Stream>>,

    /// State shared with the reader and with request handles.
    shared: Arc<Shared>,
}

impl<Stream> Drop for InnerConnection<Stream> {
    fn drop(&mut self) {
        self.shared.close(Error::ConnectionClosed);
    }
}

impl<Stream> InnerConnection<Stream>
where
    Stream: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Implementation of sending a request.
    async fn send_request<Req: ComposeRequest + Clone>(
        &self,
        request: &Req,
    ) -> Result<Request, Error> {
        let mut request = request.clone();

        // Reserve an ID in the outstanding-request table.
        let (id, receiver, add_keepalive) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            if state.outstanding.len() >= usize::from(u16::MAX) {
                return Err(Error::StreamTooManyOutstandingQueries);
            }
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            let (sender, receiver) = oneshot::channel();
            match state.outstanding.entry(id) {
                Entry::Occupied(_) => {
                    return Err(Error::StreamDuplicateId);
                }
                Entry::Vacant(entry) => {
                    entry.insert(sender);
                }
            }
            let add_keepalive = self.config.idle_keepalive.is_some()
                && state.send_keepalive;
            (id, receiver, add_keepalive)
        };

        let res = self.compose_and_write(&mut request, id, add_keepalive).await;
        let request_msg = match res {
            Ok(msg) => msg,
            Err(err) => {
                match &err {
                    Error::StreamWriteError(_) => {
                        // The stream is broken; everybody fails.
                        self.shared.close(err.clone());
                    }
                    _ => {
                        self.shared.remove(id);
                    }
                }
                return Err(err);
            }
        };

        if add_keepalive {
            self.shared.state.lock().send_keepalive = false;
        }

        Ok(Request {
            request_msg,
            id,
            receiver,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Rewrites the request, applies EDNS options and writes the frame.
    ///
    /// Returns the message as sent so the response can be verified
    /// against it.
    async fn compose_and_write<Req: ComposeRequest>(
        &self,
        request: &mut Req,
        id: u16,
        add_keepalive: bool,
    ) -> Result<Message<Vec<u8>>, Error> {
        request.header_mut().set_id(id);

        if add_keepalive {
            if let Some(timeout) = self.config.idle_keepalive {
                let timeout = IdleTimeout::try_from(timeout)
                    .unwrap_or_else(|_| IdleTimeout::from(u16::MAX));
                request.add_opt(&TcpKeepalive::new(Some(timeout)))?;
            }
        }

        if let Some(block) = self.config.padding_block {
            let unpadded_len = request.to_vec()?.len();
            let padding = vec![0; padding_len(unpadded_len, block)];
            // RFC 7830 suggests zeros but random fill gives an
            // eavesdropper even less to work with.
            let padding = fill_random(padding);
            request.add_opt(&Padding::from_octets(padding)?)?;
        }

        let request_msg = request.to_message()?;
        let slice = request_msg.as_slice();
        let len = u16::try_from(slice.len())
            .map_err(|_| Error::StreamLongMessage)?;

        let mut frame = Vec::with_capacity(
            FRAME_PREFIX_LEN + slice.len(),
        );
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(slice);

        let mut write = self.write.lock().await;
        write
            .write_all(&frame)
            .await
            .map_err(|e| Error::StreamWriteError(Arc::new(e)))?;
        write
            .flush()
            .await
            .map_err(|e| Error::StreamWriteError(Arc::new(e)))?;
        drop(write);

        Ok(request_msg)
    }
}

//------------ Shared ---------------------------------------------------------

/// State shared between connection, reader and request handles.
#[derive(Debug)]
struct Shared {
    /// The outstanding-request table and associated bookkeeping.
    state: Mutex<State>,

    /// Signalled when the connection is being torn down.
    ///
    /// Shared with the reader, which must be able to await it without
    /// keeping the rest of the state alive.
    closed: Arc<Notify>,
}

/// The outstanding-request table and associated bookkeeping.
#[derive(Debug)]
struct State {
    /// Maps in-flight message IDs to their response slot.
    outstanding: HashMap<u16, oneshot::Sender<ChanResp>>,

    /// The ID the next request will use.
    next_id: u16,

    /// The connection no longer takes requests.
    closed: bool,

    /// Do we need to include edns-tcp-keepalive in an outgoing request.
    ///
    /// True at the start of the connection; cleared once the option went
    /// out successfully.
    send_keepalive: bool,

    /// Idle timeout the server advertised through edns-tcp-keepalive.
    advertised_idle: Option<Duration>,
}

/// A response or error delivered to a request handle.
type ChanResp = Result<Message<Bytes>, Error>;

impl Shared {
    /// Marks the connection closed and fails all outstanding requests.
    fn close(&self, error: Error) {
        let senders = {
            let mut state = self.state.lock();
            state.closed = true;
            state.outstanding.drain().map(|(_, tx)| tx).collect::<Vec<_>>()
        };
        for sender in senders {
            let _ = sender.send(Err(error.clone()));
        }
        // notify_one stores a permit, so the reader learns about the
        // teardown even if it is not parked on the notification yet.
        self.closed.notify_one();
    }

    /// Removes a single entry from the outstanding-request table.
    fn remove(&self, id: u16) {
        let _ = self.state.lock().outstanding.remove(&id);
    }

    /// Delivers a decoded response to the matching request, if any.
    fn dispatch(&self, answer: Message<Bytes>) {
        if let Some(opts) = answer.opt() {
            for option in opts
                .opt()
                .iter::<AllOptData<Bytes, Name<Bytes>>>()
                .flatten()
            {
                if let AllOptData::TcpKeepalive(keepalive) = option {
                    if let Some(timeout) = keepalive.timeout() {
                        let timeout = Duration::from(timeout);
                        trace!(
                            "server advertised idle timeout {:?}",
                            timeout
                        );
                        self.state.lock().advertised_idle = Some(timeout);
                    }
                }
            }
        }

        let id = answer.header().id();
        let sender = self.state.lock().outstanding.remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(answer));
            }
            None => {
                // Not fatal; the connection stays up. The response may
                // belong to a request that was cancelled in the meantime.
                debug!("dropping response with unknown id {}", id);
            }
        }
    }
}

//------------ Request --------------------------------------------------------

/// An active request on a stream connection.
///
/// Dropping the request removes it from the outstanding-request table.
#[derive(Debug)]
pub struct Request {
    /// The request message as sent, for verifying the response.
    request_msg: Message<Vec<u8>>,

    /// The ID the request went out with.
    id: u16,

    /// Receives the response from the reader.
    receiver: oneshot::Receiver<ChanResp>,

    /// Handle for removing the table entry on drop.
    shared: Weak<Shared>,
}

impl Request {
    /// Returns the message ID the request was sent with.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Awaits the response to the request.
    pub async fn get_response(mut self) -> Result<Message<Bytes>, Error> {
        let res = (&mut self.receiver).await;
        let answer = match res {
            Ok(res) => res?,
            Err(_) => return Err(Error::StreamReceiveError),
        };
        if !is_answer_ignore_id(&answer, &self.request_msg) {
            return Err(Error::WrongReplyForQuery);
        }
        Ok(answer)
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

//------------ Transport ------------------------------------------------------

/// The read side of a stream connection.
///
/// This future drives response reading and demultiplexing. It holds only a
/// weak handle onto the connection state and terminates when the stream
/// fails, the peer closes, or the connection itself is dropped.
#[derive(Debug)]
pub struct Transport<Stream> {
    /// The read half of the stream.
    read: ReadHalf<Stream>,

    /// Weak handle onto the shared connection state.
    shared: Weak<Shared>,

    /// The close notification, held strongly so it can always be awaited.
    closed: Arc<Notify>,
}

impl<Stream> Transport<Stream>
where
    Stream: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Runs the read loop until the connection dies.
    pub async fn run(self) {
        let Transport {
            mut read,
            shared,
            closed,
        } = self;
        let res = tokio::select! {
            res = Self::read_loop(&mut read, &shared) => res,
            _ = closed.notified() => Ok(()),
        };
        if let Err(err) = res {
            if let Some(shared) = shared.upgrade() {
                shared.close(err);
            }
        }
    }

    /// Reads length-prefixed frames and dispatches decoded responses.
    ///
    /// Returns `Ok(())` when the connection state is gone and the loop is
    /// no longer needed, and an error when the stream failed.
    async fn read_loop(
        read: &mut ReadHalf<Stream>,
        shared: &Weak<Shared>,
    ) -> Result<(), Error> {
        loop {
            let len = read.read_u16().await.map_err(map_read_error)? as usize;

            let mut buf = vec![0u8; len];
            read.read_exact(&mut buf).await.map_err(map_read_error)?;

            if len < MIN_FRAME_LEN {
                // The frame cannot hold a message. Skip it; the
                // matching request will run into its own deadline.
                warn!("skipping short frame of {} octets", len);
                continue;
            }

            let answer = match Message::from_octets(Bytes::from(buf)) {
                Ok(answer) => answer,
                Err(_) => {
                    warn!("skipping undecodable response frame");
                    continue;
                }
            };

            match shared.upgrade() {
                Some(shared) => shared.dispatch(answer),
                None => return Ok(()),
            }
        }
    }
}

//------------ Utility --------------------------------------------------------

/// Maps an I/O error from the frame body read to a transport error.
fn map_read_error(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::StreamUnexpectedEndOfData
    } else {
        Error::StreamReadError(Arc::new(err))
    }
}

/// Returns the number of padding octets for an encoded message.
///
/// The padding is sized such that the message, the padding option and the
/// two octet length prefix together are a multiple of the block length.
fn padding_len(unpadded_len: usize, block: usize) -> usize {
    let overhead = PADDING_OPT_HEADER + FRAME_PREFIX_LEN;
    (block - (unpadded_len + overhead) % block) % block
}

/// Fills a buffer from the thread CSPRNG.
fn fill_random(mut buf: Vec<u8>) -> Vec<u8> {
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

//============ Tests =========================================================
