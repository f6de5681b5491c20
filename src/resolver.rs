//! The uniform client contract shared by all transports.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::name::ToName;
use domain::base::Message;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::protocol::AsyncConnect;
use crate::client::request::{Error, RequestMessage};
use crate::client::{do53, doh, dot};

//------------ Resolver -------------------------------------------------------

/// A client that can answer DNS requests.
///
/// All three transport engines implement this trait, so code that issues
/// queries, the lookup functions in this crate included, does not care
/// how its messages travel.
pub trait Resolver: Send + Sync {
    /// Performs a request and returns the response.
    fn query(
        &self,
        request: RequestMessage<Vec<u8>>,
    ) -> Pin<
        Box<dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_>,
    >;
}

/// Queries for a single question through a resolver.
///
/// Builds a recursion-desired request with a random message ID and sends
/// it. This is the `query(name, type)` form most applications want.
pub async fn query<R: Resolver + ?Sized>(
    resolver: &R,
    qname: impl ToName,
    qtype: Rtype,
) -> Result<Message<Bytes>, Error> {
    let request = RequestMessage::from_question(qname, qtype)?;
    resolver.query(request).await
}

//--- impl Resolver for the transport engines

impl Resolver for do53::Connection {
    fn query(
        &self,
        request: RequestMessage<Vec<u8>>,
    ) -> Pin<
        Box<dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_>,
    > {
        Box::pin(async move { self.request(&request).await })
    }
}

impl<Remote> Resolver for dot::Connection<Remote>
where
    Remote: AsyncConnect + Send + Sync + 'static,
    Remote::Connection: AsyncRead + AsyncWrite + Send + 'static,
{
    fn query(
        &self,
        request: RequestMessage<Vec<u8>>,
    ) -> Pin<
        Box<dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_>,
    > {
        Box::pin(async move { self.request(&request).await })
    }
}

impl Resolver for doh::Connection {
    fn query(
        &self,
        request: RequestMessage<Vec<u8>>,
    ) -> Pin<
        Box<dyn Future<Output = Result<Message<Bytes>, Error>> + Send + '_>,
    > {
        Box::pin(async move { self.request(&request).await })
    }
}
