//! Tests for the lookup facades over a mock Do53 resolver.

mod common;

use common::{
    answer_a, answer_aaaa, answer_ptr, answer_rcode, init_logging,
    spawn_udp_server,
};
use domain::base::iana::{Rcode, Rtype};
use domain::base::Name;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use stub_resolv::client::do53;
use stub_resolv::client::request::Error;
use stub_resolv::lookup::{lookup_addr, lookup_host};

fn resolver(server: std::net::SocketAddr) -> do53::Connection {
    let mut config = do53::Config::new();
    config.udp_mut().set_read_timeout(Duration::from_millis(500));
    config.set_tcp_timeout(Duration::from_millis(500));
    do53::Connection::from_socket_addrs([server], config)
}

#[test]
fn lookup_host_merges_both_families() {
    init_logging();
    tokio_test::block_on(async {
        let server = spawn_udp_server(Arc::new(|query| {
            match query.first_question().unwrap().qtype() {
                Rtype::A => {
                    Some(answer_a(query, Ipv4Addr::new(192, 0, 2, 80)))
                }
                Rtype::AAAA => Some(answer_aaaa(
                    query,
                    Ipv6Addr::from_str("2001:db8::80").unwrap(),
                )),
                _ => Some(answer_rcode(query, Rcode::NOERROR)),
            }
        }))
        .await;

        let resolver = resolver(server);
        let found = lookup_host(
            &resolver,
            Name::<Vec<u8>>::from_str("www.example.com").unwrap(),
        )
        .await
        .unwrap();

        assert!(!found.is_empty());
        let addrs: Vec<IpAddr> = found.iter().collect();
        assert_eq!(addrs.len(), 2);
        assert!(addrs
            .contains(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 80))));
        assert!(addrs.contains(&IpAddr::V6(
            Ipv6Addr::from_str("2001:db8::80").unwrap()
        )));

        let sockets: Vec<_> = found.port_iter(53).collect();
        assert!(sockets.iter().all(|addr| addr.port() == 53));
    });
}

#[test]
fn lookup_host_fails_when_one_family_fails() {
    init_logging();
    tokio_test::block_on(async {
        // AAAA queries get a server failure, A queries an answer. The
        // lookup must not return a partial result.
        let server = spawn_udp_server(Arc::new(|query| {
            match query.first_question().unwrap().qtype() {
                Rtype::A => {
                    Some(answer_a(query, Ipv4Addr::new(192, 0, 2, 80)))
                }
                _ => Some(answer_rcode(query, Rcode::SERVFAIL)),
            }
        }))
        .await;

        let resolver = resolver(server);
        match lookup_host(
            &resolver,
            Name::<Vec<u8>>::from_str("www.example.com").unwrap(),
        )
        .await
        {
            Err(Error::ErrorResponse(rcode)) => {
                assert_eq!(rcode, Rcode::SERVFAIL)
            }
            res => panic!(
                "expected the lookup to fail, got {:?}",
                res.map(|found| found.iter().collect::<Vec<_>>())
            ),
        }
    });
}

#[test]
fn lookup_addr_returns_ptr_name() {
    init_logging();
    tokio_test::block_on(async {
        let server = spawn_udp_server(Arc::new(|query| {
            let question = query.first_question().unwrap();
            assert_eq!(question.qtype(), Rtype::PTR);
            // The reverse name of 192.0.2.80.
            assert_eq!(
                format!("{}", question.qname()),
                "80.2.0.192.in-addr.arpa"
            );
            Some(answer_ptr(query, "www.example.com"))
        }))
        .await;

        let resolver = resolver(server);
        let found = lookup_addr(
            &resolver,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 80)),
        )
        .await
        .unwrap();
        assert_eq!(format!("{}", found.first()), "www.example.com");
    });
}

#[test]
fn lookup_addr_without_ptr_is_no_answer() {
    init_logging();
    tokio_test::block_on(async {
        let server = spawn_udp_server(Arc::new(|query| {
            Some(answer_rcode(query, Rcode::NOERROR))
        }))
        .await;

        let resolver = resolver(server);
        match lookup_addr(
            &resolver,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 81)),
        )
        .await
        {
            Err(Error::NoAnswer) => {}
            res => panic!(
                "expected no-answer, got {:?}",
                res.map(|found| format!("{}", found.first()))
            ),
        }
    });
}
