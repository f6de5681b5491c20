//! Looking up host names for addresses.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::message::RecordIter;
use domain::base::name::{Name, ParsedName};
use domain::base::Message;
use domain::rdata::Ptr;
use std::net::IpAddr;

use crate::client::request::Error;
use crate::resolver::{query, Resolver};

//------------ lookup_addr ---------------------------------------------------

/// Finds the host names for an IP address.
///
/// The address is turned into its reverse name under `in-addr.arpa.` or
/// `ip6.arpa.` and queried for PTR records. An answer without any PTR
/// record fails with [`Error::NoAnswer`]; a successful return thus always
/// yields at least one name.
pub async fn lookup_addr<R: Resolver + ?Sized>(
    resolver: &R,
    addr: IpAddr,
) -> Result<FoundAddrs, Error> {
    let qname = Name::<Vec<u8>>::reverse_from_addr(addr)
        .map_err(|_| Error::MessageBuilderPushError)?;
    let answer = query(resolver, qname, Rtype::PTR).await?;
    let found = FoundAddrs(answer);
    if found.iter().next().is_none() {
        return Err(Error::NoAnswer);
    }
    Ok(found)
}

//------------ FoundAddrs ----------------------------------------------------

/// The value returned by a successful reverse lookup.
///
/// Iterating over it yields the host names in answer order; there is at
/// least one.
#[derive(Debug)]
pub struct FoundAddrs(Message<Bytes>);

impl FoundAddrs {
    /// Returns an iterator over the host names.
    pub fn iter(&self) -> FoundAddrsIter<'_> {
        FoundAddrsIter {
            name: self.0.for_slice().canonical_name(),
            answer: self
                .0
                .for_slice()
                .answer()
                .ok()
                .map(|answer| answer.limit_to::<Ptr<_>>()),
        }
    }

    /// Returns the first host name of the answer.
    pub fn first(&self) -> ParsedName<&[u8]> {
        self.iter()
            .next()
            .expect("constructed only with at least one PTR record")
    }
}

impl<'a> IntoIterator for &'a FoundAddrs {
    type Item = ParsedName<&'a [u8]>;
    type IntoIter = FoundAddrsIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

//------------ FoundAddrsIter ------------------------------------------------

/// An iterator over the host names returned by a reverse lookup.
#[derive(Clone, Debug)]
pub struct FoundAddrsIter<'a> {
    /// The canonical name the PTR records must be owned by.
    name: Option<ParsedName<&'a [u8]>>,

    /// The PTR records of the answer.
    answer: Option<RecordIter<'a, [u8], Ptr<ParsedName<&'a [u8]>>>>,
}

impl<'a> Iterator for FoundAddrsIter<'a> {
    type Item = ParsedName<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.name.as_ref()?;
        let answer = self.answer.as_mut()?;
        while let Some(Ok(record)) = answer.next() {
            if record.owner() == name {
                return Some(record.into_data().into_ptrdname());
            }
        }
        None
    }
}
