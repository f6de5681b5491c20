//! DNS over HTTPS: posting wire messages to a resolver URL.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

// RFC 8484 describes DNS over HTTPS.

use bytes::Bytes;
use domain::base::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

use crate::client::request::{
    check_response, is_answer, ComposeRequest, Error,
};

/// The media type of a DNS message in an HTTP body.
///
/// The legacy `application/dns-udpwireformat` type is not accepted.
const DNS_CONTENT_TYPE: &str = "application/dns-message";

/// Default deadline for a query.
const DEF_TIMEOUT: Duration = Duration::from_secs(4);

//------------ Config ---------------------------------------------------------

/// Configuration for a DNS-over-HTTPS transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// Deadline for a single query.
    timeout: Duration,

    /// Whether responses with a non-NOERROR status are errors.
    strict_rcode: bool,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the query deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the query deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout
    }

    /// Returns whether error statuses are raised as errors.
    pub fn strict_rcode(&self) -> bool {
        self.strict_rcode
    }

    /// Sets whether error statuses are raised as errors.
    pub fn set_strict_rcode(&mut self, strict: bool) {
        self.strict_rcode = strict
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEF_TIMEOUT,
            strict_rcode: true,
        }
    }
}

//------------ Connection -----------------------------------------------------

/// A DNS-over-HTTPS transport towards a single resolver URL.
///
/// Every request is a POST carrying the wire message. Connection reuse,
/// TLS and response correlation are all the HTTP client's business; this
/// transport only serialises request submission so requests leave in a
/// predictable order, and validates what comes back. The caller's message
/// is sent as composed, message ID included.
#[derive(Clone, Debug)]
pub struct Connection {
    /// Reference to the actual connection object.
    inner: Arc<InnerConnection>,
}

impl Connection {
    /// Creates a new transport towards the built-in resolver URL.
    pub fn from_default_url() -> Result<Self, Error> {
        Self::new(crate::conf::default_doh_url())
    }

    /// Creates a new transport towards the given URL.
    pub fn new(url: Url) -> Result<Self, Error> {
        Self::with_config(url, Default::default())
    }

    /// Creates a new transport towards the given URL with a config.
    pub fn with_config(url: Url, config: Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            inner: Arc::new(InnerConnection {
                config,
                url,
                client,
                send_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Returns the resolver URL.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Performs a request and returns the response.
    pub async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        match timeout(
            self.inner.config.timeout,
            self.inner.request(request),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::RequestTimedOut),
        }
    }
}

//------------ InnerConnection ------------------------------------------------

/// Actual implementation of the DNS-over-HTTPS transport.
#[derive(Debug)]
struct InnerConnection {
    /// User configuration.
    config: Config,

    /// The resolver URL requests are posted to.
    url: Url,

    /// The HTTP client, shared across requests for connection reuse.
    client: reqwest::Client,

    /// Serialises request submission.
    send_lock: tokio::sync::Mutex<()>,
}

impl InnerConnection {
    /// Implementation of performing a request.
    async fn request<CR: ComposeRequest + Clone>(
        &self,
        request: &CR,
    ) -> Result<Message<Bytes>, Error> {
        let request_msg = request.to_message()?;
        let body = request_msg.as_octets().clone();

        let response = {
            let _lock = self.send_lock.lock().await;
            self.client
                .post(self.url.clone())
                .header(reqwest::header::CONTENT_TYPE, DNS_CONTENT_TYPE)
                .body(body)
                .send()
                .await?
        };

        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status().as_u16()));
        }
        if !has_dns_content_type(&response) {
            return Err(Error::HttpContentType);
        }

        let body = response.bytes().await?;
        let answer = Message::from_octets(body)
            .map_err(|_| Error::ShortMessage)?;
        if !is_answer(&answer, &request_msg) {
            return Err(Error::WrongReplyForQuery);
        }
        check_response(&answer, true, self.config.strict_rcode)?;
        Ok(answer)
    }
}

//------------ Utility --------------------------------------------------------

/// Returns whether a response carries the DNS message content type.
///
/// Parameters after the media type are tolerated; a different media type,
/// including the legacy UDP wire format one, is not.
fn has_dns_content_type(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case(DNS_CONTENT_TYPE)
        })
        .unwrap_or(false)
}
