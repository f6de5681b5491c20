//! Looking up host names.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::message::RecordIter;
use domain::base::name::{ParsedName, ToName};
use domain::base::Message;
use domain::rdata::{Aaaa, A};
use std::net::{IpAddr, SocketAddr};

use crate::client::request::Error;
use crate::resolver::{query, Resolver};

//------------ lookup_host ---------------------------------------------------

/// Resolves a host name into its IP addresses.
///
/// The A and AAAA queries are issued concurrently. If either of them
/// fails the whole lookup fails; no partial result is returned. The value
/// returned on success can be iterated for the addresses, or for socket
/// addresses with a given port.
pub async fn lookup_host<R: Resolver + ?Sized>(
    resolver: &R,
    qname: impl ToName + Clone,
) -> Result<FoundHosts, Error> {
    let (a, aaaa) = tokio::join!(
        query(resolver, qname.clone(), Rtype::A),
        query(resolver, qname, Rtype::AAAA),
    );
    Ok(FoundHosts {
        a: a?,
        aaaa: aaaa?,
    })
}

//------------ FoundHosts ----------------------------------------------------

/// The value returned by a successful host lookup.
#[derive(Debug)]
pub struct FoundHosts {
    /// The answer to the A query.
    a: Message<Bytes>,

    /// The answer to the AAAA query.
    aaaa: Message<Bytes>,
}

impl FoundHosts {
    /// Returns whether the lookup produced no addresses at all.
    pub fn is_empty(&self) -> bool {
        self.a.header_counts().ancount() == 0
            && self.aaaa.header_counts().ancount() == 0
    }

    /// Returns the canonical name of the host.
    ///
    /// If the host name is an alias, this is the name at the end of the
    /// CNAME trail. The canonical name is expected to be the same in both
    /// answers; if it is not, the one from the AAAA answer is returned.
    pub fn canonical_name(&self) -> Option<ParsedName<Bytes>> {
        self.aaaa
            .canonical_name()
            .or_else(|| self.a.canonical_name())
    }

    /// Returns an iterator over the addresses of the host.
    ///
    /// IPv6 addresses come first, then IPv4.
    pub fn iter(&self) -> FoundHostsIter<'_> {
        FoundHostsIter {
            aaaa_name: self.aaaa.for_slice().canonical_name(),
            a_name: self.a.for_slice().canonical_name(),
            aaaa: self
                .aaaa
                .for_slice()
                .answer()
                .ok()
                .map(|answer| answer.limit_to::<Aaaa>()),
            a: self
                .a
                .for_slice()
                .answer()
                .ok()
                .map(|answer| answer.limit_to::<A>()),
        }
    }

    /// Returns an iterator over socket addresses with the given port.
    pub fn port_iter(&self, port: u16) -> FoundHostsSocketIter<'_> {
        FoundHostsSocketIter {
            iter: self.iter(),
            port,
        }
    }
}

impl<'a> IntoIterator for &'a FoundHosts {
    type Item = IpAddr;
    type IntoIter = FoundHostsIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

//------------ FoundHostsIter ------------------------------------------------

/// An iterator over the IP addresses returned by a host lookup.
///
/// Only records owned by the canonical name of their answer are returned,
/// so stray records smuggled into the answer section are ignored.
#[derive(Clone, Debug)]
pub struct FoundHostsIter<'a> {
    /// The canonical name in the AAAA answer.
    aaaa_name: Option<ParsedName<&'a [u8]>>,

    /// The canonical name in the A answer.
    a_name: Option<ParsedName<&'a [u8]>>,

    /// The AAAA records of the AAAA answer.
    aaaa: Option<RecordIter<'a, [u8], Aaaa>>,

    /// The A records of the A answer.
    a: Option<RecordIter<'a, [u8], A>>,
}

impl<'a> Iterator for FoundHostsIter<'a> {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        if let (Some(name), Some(iter)) =
            (self.aaaa_name.as_ref(), self.aaaa.as_mut())
        {
            while let Some(Ok(record)) = iter.next() {
                if record.owner() == name {
                    return Some(record.data().addr().into());
                }
            }
        }
        if let (Some(name), Some(iter)) =
            (self.a_name.as_ref(), self.a.as_mut())
        {
            while let Some(Ok(record)) = iter.next() {
                if record.owner() == name {
                    return Some(record.data().addr().into());
                }
            }
        }
        None
    }
}

//------------ FoundHostsSocketIter ------------------------------------------

/// An iterator over socket addresses gained from a host lookup.
#[derive(Clone, Debug)]
pub struct FoundHostsSocketIter<'a> {
    /// The underlying address iterator.
    iter: FoundHostsIter<'a>,

    /// The port to combine the addresses with.
    port: u16,
}

impl<'a> Iterator for FoundHostsSocketIter<'a> {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<SocketAddr> {
        self.iter
            .next()
            .map(|addr| SocketAddr::new(addr, self.port))
    }
}
