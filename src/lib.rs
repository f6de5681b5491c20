//! A unicast DNS stub-resolver transport library.
//!
//! This crate contains the client side of the DNS: it sends questions to a
//! recursive resolver and hands back the parsed response. It does not
//! recurse, validate, or cache; it moves messages. Three transports are
//! provided, all implementing the same [`Resolver`][resolver::Resolver]
//! contract:
//!
//! * [`client::do53`]: classic DNS over UDP port 53 with fallback to TCP
//!   when a response comes back truncated,
//! * [`client::dot`]: DNS over TLS (RFC 7858) with many concurrent queries
//!   multiplexed over one long-lived connection,
//! * [`client::doh`]: DNS over HTTPS (RFC 8484) using POST requests.
//!
//! Messages themselves are handled by the [`domain`] crate; this crate
//! only deals in composed requests and parsed responses.
//!
//! The usual entry points are [`lookup::lookup_host`] for name-to-address
//! resolution, [`lookup::lookup_addr`] for the reverse direction, and
//! [`RequestMessage::from_question`][client::request::RequestMessage::from_question]
//! together with an engine's `request` method for everything else.
//!
//! Server defaults live in [`conf`]: the platform resolver list for Do53
//! and a built-in set of public resolvers for DoT and DoH. Applications
//! can replace either list wholesale.

#![allow(clippy::uninlined_format_args)]

pub mod client;
pub mod conf;
pub mod lookup;
pub mod resolver;
