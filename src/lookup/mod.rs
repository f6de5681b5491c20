//! Lookup functions.
//!
//! Thin facades over a single query: [`lookup_host`] resolves a host name
//! into its addresses, [`lookup_addr`] finds the host names for an
//! address.

pub use self::addr::{lookup_addr, FoundAddrs};
pub use self::host::{lookup_host, FoundHosts};

pub mod addr;
pub mod host;
