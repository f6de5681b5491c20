//! DNS transport protocols.
//!
//! Every transport engine in this module does the same thing, send a
//! request and return the response, but differs in how the bytes travel:
//!
//! * [`do53`] walks a list of plain DNS servers, trying UDP first and
//!   promoting to TCP when a reply is truncated,
//! * [`dot`] multiplexes requests over a single lazily established TLS
//!   connection, correlating responses by message ID,
//! * [`doh`] posts requests to an HTTPS endpoint and lets the HTTP stack
//!   do the correlating,
//! * [`stream`] is the shared machinery beneath any stream transport:
//!   length-prefixed framing, the outstanding-request table and the
//!   background reader,
//! * [`dgram`] is a single UDP request/response exchange,
//! * [`protocol`] contains the connectors that produce sockets and TLS
//!   streams,
//! * [`request`] defines how requests are composed and which errors a
//!   transport can produce.

pub mod dgram;
pub mod do53;
pub mod doh;
pub mod dot;
pub mod protocol;
pub mod request;
pub mod stream;
