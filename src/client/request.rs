//! Constructing requests and the errors transports produce.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::iana::{Rcode, Rtype};
use domain::base::message::CopyRecordsError;
use domain::base::message_builder::{
    AdditionalBuilder, MessageBuilder, PushError, StaticCompressor,
};
use domain::base::name::{ParsedName, ToName};
use domain::base::opt::{AllOptData, ComposeOptData, LongOptData, OptRecord};
use domain::base::wire::Composer;
use domain::base::{Header, Message, Question};
use domain::rdata::AllRecordData;
use octseq::Octets;
use std::fmt::Debug;
use std::sync::Arc;
use std::vec::Vec;
use std::{error, fmt};

//------------ ComposeRequest ------------------------------------------------

/// A request that can still be edited before it is sent.
///
/// Transports use this to rewrite the message ID and to attach EDNS
/// options without having to understand the full message structure.
pub trait ComposeRequest: Debug + Send + Sync {
    /// Create a message that captures the recorded changes.
    fn to_message(&self) -> Result<Message<Vec<u8>>, Error>;

    /// Create a message that captures the recorded changes as a vec.
    fn to_vec(&self) -> Result<Vec<u8>, Error>;

    /// Return a mutable reference to the header to record changes.
    fn header_mut(&mut self) -> &mut Header;

    /// Set the UDP payload size of the OPT record, adding one if needed.
    fn set_udp_payload_size(&mut self, value: u16);

    /// Add an EDNS option, adding an OPT record if needed.
    fn add_opt(
        &mut self,
        opt: &impl ComposeOptData,
    ) -> Result<(), LongOptData>;
}

//------------ RequestMessage ------------------------------------------------

/// A request wrapping an existing message.
///
/// The wrapped message is left untouched. Header changes and EDNS options
/// are recorded separately and merged in when the request is composed for
/// sending. An OPT record already present in the message is carried over,
/// so options the caller put there survive the trip.
#[derive(Clone, Debug)]
pub struct RequestMessage<Octs: AsRef<[u8]>> {
    /// Base message.
    msg: Message<Octs>,

    /// New header.
    header: Header,

    /// The OPT record to add if required.
    opt: Option<OptRecord<Vec<u8>>>,
}

impl<Octs: AsRef<[u8]> + Debug + Octets> RequestMessage<Octs> {
    /// Creates a new request from a message.
    pub fn new(msg: impl Into<Message<Octs>>) -> Self {
        let msg = msg.into();
        let header = msg.header();
        let opt = msg.opt().map(|src| {
            let mut opt = OptRecord::default();
            opt.set_udp_payload_size(src.udp_payload_size());
            opt.set_dnssec_ok(src.dnssec_ok());
            for option in src.opt().iter::<AllOptData<_, _>>().flatten() {
                // A parsed option always fits into a fresh OPT record.
                let _ = opt.push(&option);
            }
            opt
        });
        Self { msg, header, opt }
    }

    /// Returns a mutable reference to the OPT record.
    ///
    /// Adds one if necessary.
    fn opt_mut(&mut self) -> &mut OptRecord<Vec<u8>> {
        self.opt.get_or_insert_with(Default::default)
    }

    /// Appends the message to a message builder.
    fn append_message_impl<Target: Composer>(
        &self,
        mut target: MessageBuilder<Target>,
    ) -> Result<AdditionalBuilder<Target>, CopyRecordsError> {
        let source = &self.msg;

        *target.header_mut() = self.header;

        let source = source.question();
        let mut target = target.question();
        for rr in source {
            target.push(rr?)?;
        }
        let mut source = source.answer()?;
        let mut target = target.answer();
        for rr in &mut source {
            let rr = rr?
                .into_record::<AllRecordData<_, ParsedName<_>>>()?
                .expect("record expected");
            target.push(rr)?;
        }

        let mut source =
            source.next_section()?.expect("section should be present");
        let mut target = target.authority();
        for rr in &mut source {
            let rr = rr?
                .into_record::<AllRecordData<_, ParsedName<_>>>()?
                .expect("record expected");
            target.push(rr)?;
        }

        let source =
            source.next_section()?.expect("section should be present");
        let mut target = target.additional();
        for rr in source {
            let rr = rr?;
            if rr.rtype() != Rtype::OPT {
                let rr = rr
                    .into_record::<AllRecordData<_, ParsedName<_>>>()?
                    .expect("record expected");
                target.push(rr)?;
            }
        }

        if let Some(opt) = self.opt.as_ref() {
            target.push(opt.as_record())?;
        }

        Ok(target)
    }

    /// Creates a new message from the base message and the changes.
    fn to_message_impl(&self) -> Result<Message<Vec<u8>>, Error> {
        let target =
            MessageBuilder::from_target(StaticCompressor::new(Vec::new()))
                .expect("Vec is expected to have enough space");
        let target = self.append_message_impl(target)?;
        let msg = Message::from_octets(
            target.finish().into_target(),
        )
        .expect("a message builder only produces parseable messages");
        Ok(msg)
    }
}

impl RequestMessage<Vec<u8>> {
    /// Creates a request for a single question.
    ///
    /// The request asks for recursion and carries a random message ID.
    /// This is what the lookup functions and most direct uses of the
    /// transport engines start from.
    pub fn from_question(
        qname: impl ToName,
        qtype: Rtype,
    ) -> Result<Self, Error> {
        let mut msg = MessageBuilder::new_vec();
        msg.header_mut().set_random_id();
        msg.header_mut().set_rd(true);
        let mut msg = msg.question();
        msg.push(Question::new_in(qname, qtype))
            .map_err(|_| Error::MessageBuilderPushError)?;
        Ok(Self::new(msg.into_message()))
    }
}

impl<Octs: AsRef<[u8]> + Clone + Debug + Octets + Send + Sync + 'static>
    ComposeRequest for RequestMessage<Octs>
{
    fn to_vec(&self) -> Result<Vec<u8>, Error> {
        self.to_message().map(|msg| msg.as_octets().clone())
    }

    fn to_message(&self) -> Result<Message<Vec<u8>>, Error> {
        self.to_message_impl()
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn set_udp_payload_size(&mut self, value: u16) {
        self.opt_mut().set_udp_payload_size(value);
    }

    fn add_opt(
        &mut self,
        opt: &impl ComposeOptData,
    ) -> Result<(), LongOptData> {
        self.opt_mut().push(opt).map_err(|e| e.unlimited_buf())
    }
}

//------------ Answer matching -----------------------------------------------

/// Checks whether a reply answers a query, message IDs included.
///
/// This is the check for transports that send the query ID unchanged.
pub fn is_answer<
    ReplyOcts: AsRef<[u8]> + Octets,
    QueryOcts: AsRef<[u8]> + Octets,
>(
    reply: &Message<ReplyOcts>,
    query: &Message<QueryOcts>,
) -> bool {
    reply.header().id() == query.header().id()
        && is_answer_ignore_id(reply, query)
}

/// Checks whether a reply answers a query, ignoring the message IDs.
///
/// Stream transports rewrite the ID and match it through their
/// outstanding-request table, so only the rest of the reply is checked
/// here: the QR bit must be set and the question section must be the
/// query's. A truncated or error reply may elide the question section,
/// provided every other section is empty as well.
pub fn is_answer_ignore_id<
    ReplyOcts: AsRef<[u8]> + Octets,
    QueryOcts: AsRef<[u8]> + Octets,
>(
    reply: &Message<ReplyOcts>,
    query: &Message<QueryOcts>,
) -> bool {
    let reply_header = reply.header();
    let reply_hcounts = reply.header_counts();

    if !reply_header.qr() {
        return false;
    }

    if (reply_header.tc() || reply_header.rcode() != Rcode::NOERROR)
        && reply_hcounts.qdcount() == 0
        && reply_hcounts.ancount() == 0
        && reply_hcounts.nscount() == 0
        && reply_hcounts.arcount() == 0
    {
        return true;
    }

    if reply_hcounts.qdcount() != query.header_counts().qdcount() {
        false
    } else {
        reply.question() == query.question()
    }
}

//------------ Response validation -------------------------------------------

/// Checks a decoded response against the response rules.
///
/// A response must have its QR bit set. On a stream transport a truncated
/// response is a protocol violation since streams cannot truncate. A
/// non-NOERROR status is an error only when `strict_rcode` asks for it;
/// otherwise the response is handed to the caller as is.
pub fn check_response(
    answer: &Message<Bytes>,
    from_stream: bool,
    strict_rcode: bool,
) -> Result<(), Error> {
    let header = answer.header();
    if !header.qr() {
        return Err(Error::NotAResponse);
    }
    if from_stream && header.tc() {
        return Err(Error::TruncatedResponse);
    }
    if strict_rcode && header.rcode() != Rcode::NOERROR {
        return Err(Error::ErrorResponse(header.rcode()));
    }
    Ok(())
}

//------------ Error ---------------------------------------------------------

/// Error type for client transports.
#[derive(Clone, Debug)]
pub enum Error {
    /// The server list is empty.
    NoServers,

    /// All configured servers have been tried without a usable response.
    NoTransportAvailable,

    /// Connection was already closed.
    ConnectionClosed,

    /// No response arrived before the request deadline.
    RequestTimedOut,

    /// Connecting to a server failed.
    Connect(Arc<std::io::Error>),

    /// The OPT record has become too long.
    OptTooLong,

    /// PushError from MessageBuilder.
    MessageBuilderPushError,

    /// ParseError from Message.
    MessageParseError,

    /// Octet sequence too short to be a valid DNS message.
    ShortMessage,

    /// Message too long for a stream transport.
    StreamLongMessage,

    /// A request was issued with a message ID that is already in flight.
    StreamDuplicateId,

    /// Error receiving a reply.
    StreamReceiveError,

    /// Reading from a stream gave an error.
    StreamReadError(Arc<std::io::Error>),

    /// Too many outstanding queries on a single stream transport.
    StreamTooManyOutstandingQueries,

    /// Writing to a stream gave an error.
    StreamWriteError(Arc<std::io::Error>),

    /// Reading from a stream ended unexpectedly.
    StreamUnexpectedEndOfData,

    /// Reply does not match the query.
    WrongReplyForQuery,

    /// Binding or connecting a UDP socket gave an error.
    UdpConnect(Arc<std::io::Error>),

    /// Sending over UDP gave an error.
    UdpSend(Arc<std::io::Error>),

    /// Receiving over UDP gave an error.
    UdpReceive(Arc<std::io::Error>),

    /// A UDP datagram was sent only partially.
    UdpShortSend,

    /// A configuration value is out of range.
    ConfigError(&'static str),

    /// The message is not a response.
    NotAResponse,

    /// A response on a stream transport was truncated.
    TruncatedResponse,

    /// The server returned a non-success status.
    ErrorResponse(Rcode),

    /// The HTTP server answered with a non-success status code.
    HttpStatus(u16),

    /// The HTTP response did not carry the DNS message content type.
    HttpContentType,

    /// The HTTP request itself failed.
    Http(Arc<reqwest::Error>),

    /// A PTR query returned no name.
    NoAnswer,
}

impl From<LongOptData> for Error {
    fn from(_: LongOptData) -> Self {
        Self::OptTooLong
    }
}

impl From<CopyRecordsError> for Error {
    fn from(err: CopyRecordsError) -> Self {
        match err {
            CopyRecordsError::Parse(_) => Self::MessageParseError,
            CopyRecordsError::Push(_) => Self::MessageBuilderPushError,
        }
    }
}

impl From<PushError> for Error {
    fn from(_: PushError) -> Self {
        Self::MessageBuilderPushError
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoServers => write!(f, "no servers configured"),
            Error::NoTransportAvailable => {
                write!(f, "all servers failed to produce a response")
            }
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::RequestTimedOut => write!(f, "request timed out"),
            Error::Connect(err) => write!(f, "connect failed: {}", err),
            Error::OptTooLong => write!(f, "OPT record is too long"),
            Error::MessageBuilderPushError => {
                write!(f, "could not push to message builder")
            }
            Error::MessageParseError => write!(f, "could not parse message"),
            Error::ShortMessage => {
                write!(f, "octet sequence too short to be a valid message")
            }
            Error::StreamLongMessage => {
                write!(f, "message too long for stream transport")
            }
            Error::StreamDuplicateId => {
                write!(f, "message ID already in flight")
            }
            Error::StreamReceiveError => write!(f, "error receiving a reply"),
            Error::StreamReadError(err) => {
                write!(f, "error reading from stream: {}", err)
            }
            Error::StreamTooManyOutstandingQueries => {
                write!(f, "too many outstanding queries on stream")
            }
            Error::StreamWriteError(err) => {
                write!(f, "error writing to stream: {}", err)
            }
            Error::StreamUnexpectedEndOfData => {
                write!(f, "unexpected end of data")
            }
            Error::WrongReplyForQuery => {
                write!(f, "reply does not match query")
            }
            Error::UdpConnect(err) => {
                write!(f, "UDP connect failed: {}", err)
            }
            Error::UdpSend(err) => write!(f, "UDP send failed: {}", err),
            Error::UdpReceive(err) => {
                write!(f, "UDP receive failed: {}", err)
            }
            Error::UdpShortSend => write!(f, "UDP message sent partially"),
            Error::ConfigError(what) => {
                write!(f, "configuration value {} out of range", what)
            }
            Error::NotAResponse => {
                write!(f, "received message is not a response")
            }
            Error::TruncatedResponse => {
                write!(f, "response on stream transport was truncated")
            }
            Error::ErrorResponse(rcode) => {
                write!(f, "server returned error status {}", rcode)
            }
            Error::HttpStatus(status) => {
                write!(f, "HTTP request returned status {}", status)
            }
            Error::HttpContentType => {
                write!(f, "HTTP response has unexpected content type")
            }
            Error::Http(err) => write!(f, "HTTP request failed: {}", err),
            Error::NoAnswer => write!(f, "response contained no answer"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Connect(err)
            | Error::StreamReadError(err)
            | Error::StreamWriteError(err)
            | Error::UdpConnect(err)
            | Error::UdpSend(err)
            | Error::UdpReceive(err) => Some(err),
            Error::Http(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

//============ Tests =========================================================
