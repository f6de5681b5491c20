//! The server registry: where candidate resolvers come from.
//!
//! Each transport takes an explicit server list; the functions here
//! produce the lists used when the application does not supply one.
//! Supplying a list replaces the defaults entirely, there is no merging.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
#[cfg(unix)]
use std::io::BufRead;
use url::Url;

/// The default port for DNS over TLS.
const DOT_PORT: u16 = 853;

/// Servers used when the platform configuration cannot be read.
const FALLBACK_SERVERS: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

//------------ DotServer ------------------------------------------------------

/// A DNS-over-TLS server endpoint.
///
/// An endpoint is immutable once constructed: address, port, the hostname
/// used for SNI and certificate verification, and any SPKI pin material.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DotServer {
    /// The server address.
    addr: IpAddr,

    /// The TCP port, 853 unless configured otherwise.
    port: u16,

    /// The hostname presented as SNI and checked against the certificate.
    hostname: String,

    /// Base64 SPKI fingerprints of acceptable certificates.
    spki_pins: Vec<String>,
}

impl DotServer {
    /// Creates an endpoint on the default DoT port.
    pub fn new(addr: IpAddr, hostname: impl Into<String>) -> Self {
        Self::with_port(addr, DOT_PORT, hostname)
    }

    /// Creates an endpoint on a non-standard port.
    pub fn with_port(
        addr: IpAddr,
        port: u16,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            addr,
            port,
            hostname: hostname.into(),
            spki_pins: Vec::new(),
        }
    }

    /// Returns the endpoint with the given pin added.
    pub fn pinned(mut self, spki_pin: impl Into<String>) -> Self {
        self.spki_pins.push(spki_pin.into());
        self
    }

    /// Returns the server address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Returns the TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the address and port as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Returns the hostname used for SNI and certificate verification.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the configured SPKI pins.
    pub fn spki_pins(&self) -> &[String] {
        &self.spki_pins
    }

    /// Cloudflare's public DoT service.
    pub fn cloudflare() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            "cloudflare-dns.com",
        )
    }

    /// Google's public DoT service.
    pub fn google() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), "dns.google")
    }

    /// Quad9's public DoT service.
    pub fn quad9() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), "dns.quad9.net")
    }

    /// The securedns.eu DoT service, with its published SPKI pin.
    pub fn securedns() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::new(146, 185, 167, 43)),
            "dot.securedns.eu",
        )
        .pinned("h3mufC43MEqRD6uE4lz6gAgULZ5/riqH/E+U+jE3H8g=")
    }
}

/// Returns the built-in DNS-over-TLS server list.
pub fn default_dot_servers() -> Vec<DotServer> {
    vec![
        DotServer::cloudflare(),
        DotServer::google(),
        DotServer::quad9(),
        DotServer::securedns(),
    ]
}

/// Returns the built-in DNS-over-HTTPS resolver URL.
pub fn default_doh_url() -> Url {
    Url::parse("https://cloudflare-dns.com/dns-query")
        .expect("the built-in URL parses")
}

//------------ System servers -------------------------------------------------

/// Returns the plain-DNS servers the platform is configured with.
///
/// On Unix this is the `nameserver` entries of `/etc/resolv.conf` in file
/// order, duplicates preserved. When the platform configuration cannot be
/// read, or on platforms without one, a small built-in list of public
/// resolvers is returned instead. Run the result through
/// [`filter_available`] before use.
pub fn system_server_addrs() -> Vec<IpAddr> {
    system_server_addrs_impl()
        .filter(|addrs| !addrs.is_empty())
        .unwrap_or_else(|| FALLBACK_SERVERS.to_vec())
}

/// Reads the platform resolver configuration.
#[cfg(unix)]
fn system_server_addrs_impl() -> Option<Vec<IpAddr>> {
    let file = std::fs::File::open("/etc/resolv.conf").ok()?;
    Some(parse_resolv_conf(std::io::BufReader::new(file)))
}

/// Reads the platform resolver configuration.
#[cfg(not(unix))]
fn system_server_addrs_impl() -> Option<Vec<IpAddr>> {
    None
}

/// Extracts the nameserver addresses from resolv.conf content.
#[cfg(unix)]
fn parse_resolv_conf(reader: impl BufRead) -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let line = line.split(['#', ';']).next().unwrap_or("");
        let mut words = line.split_whitespace();
        if words.next() != Some("nameserver") {
            continue;
        }
        if let Some(word) = words.next() {
            // Scoped addresses ("fe80::1%eth0") are skipped; a scope id
            // cannot be expressed in a plain IpAddr.
            if let Ok(addr) = word.parse() {
                addrs.push(addr)
            }
        }
    }
    addrs
}

//------------ Availability filter --------------------------------------------

/// Drops addresses of families the host does not support and orders the
/// rest IPv4 first.
///
/// The IPv4-first ordering is deliberate: consumer routers mishandle IPv6
/// often enough that the v4 path is the better first try. Within a family
/// the input order is preserved.
pub fn filter_available(
    addrs: impl IntoIterator<Item = IpAddr>,
) -> Vec<IpAddr> {
    order_by_family(addrs, family_available(true), family_available(false))
}

/// The pure part of [`filter_available`].
fn order_by_family(
    addrs: impl IntoIterator<Item = IpAddr>,
    have_v4: bool,
    have_v6: bool,
) -> Vec<IpAddr> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for addr in addrs {
        match addr {
            IpAddr::V4(_) if have_v4 => v4.push(addr),
            IpAddr::V6(_) if have_v6 => v6.push(addr),
            _ => {}
        }
    }
    v4.extend(v6);
    v4
}

/// Returns whether the host has a socket stack for the given family.
///
/// Probed by binding an unconnected datagram socket to the wildcard
/// address of the family.
fn family_available(v4: bool) -> bool {
    let local: SocketAddr = if v4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    std::net::UdpSocket::bind(local).is_ok()
}

//============ Tests =========================================================
