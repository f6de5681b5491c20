//! Tests for the stream multiplexing engine behind DNS over TLS.
//!
//! The engine is generic over its connector, so these tests drive it over
//! plain TCP; the framing, multiplexing and recovery behaviour is the same
//! as over TLS.

mod common;

use common::{
    answer_a, answer_rcode, init_logging, spawn_tcp_server, write_frame,
};
use domain::base::iana::{Rcode, Rtype};
use domain::base::{Message, Name};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use stub_resolv::client::dot;
use stub_resolv::client::protocol::TcpConnect;
use stub_resolv::client::request::{Error, RequestMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn request(name: &str) -> RequestMessage<Vec<u8>> {
    RequestMessage::from_question(
        Name::<Vec<u8>>::from_str(name).unwrap(),
        Rtype::A,
    )
    .unwrap()
}

/// Maps a name in the 198.51.100.0/24 test net from its first label.
fn addr_for_name(query: &Message<Vec<u8>>) -> Ipv4Addr {
    let qname =
        format!("{}", query.first_question().unwrap().qname());
    let octet = qname
        .split('.')
        .next()
        .and_then(|label| label.strip_prefix("host"))
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0);
    Ipv4Addr::new(198, 51, 100, octet)
}

#[test]
fn roundtrip_and_id_rewrite() {
    init_logging();
    tokio_test::block_on(async {
        let server = spawn_tcp_server(
            Arc::new(|query| Some(answer_a(query, addr_for_name(query)))),
            None,
        )
        .await;

        let conn = dot::Connection::new([TcpConnect::new(server)]);
        let answer = conn.request(&request("host1.example.com")).await.unwrap();
        assert!(answer.header().qr());
        assert_eq!(answer.header_counts().ancount(), 1);
    });
}

#[test]
fn concurrent_requests_share_one_connection() {
    init_logging();
    tokio_test::block_on(async {
        let server = spawn_tcp_server(
            Arc::new(|query| Some(answer_a(query, addr_for_name(query)))),
            None,
        )
        .await;

        let conn = dot::Connection::new([TcpConnect::new(server)]);
        let mut futs = Vec::new();
        for i in 1..=16u8 {
            let conn = conn.clone();
            let name = format!("host{}.example.com", i);
            futs.push(tokio::spawn(async move {
                let answer = conn.request(&request(&name)).await.unwrap();
                (i, answer)
            }));
        }
        for fut in futs {
            let (i, answer) = fut.await.unwrap();
            let record = answer
                .answer()
                .unwrap()
                .limit_to::<domain::rdata::A>()
                .next()
                .unwrap()
                .unwrap();
            assert_eq!(
                record.data().addr(),
                Ipv4Addr::new(198, 51, 100, i)
            );
        }
    });
}

#[test]
fn responses_correlate_out_of_order() {
    init_logging();
    tokio_test::block_on(async {
        // A hand-driven server that answers two queries in reverse order.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut queries = Vec::new();
            for _ in 0..2 {
                let len = stream.read_u16().await.unwrap() as usize;
                let mut buf = vec![0u8; len];
                stream.read_exact(&mut buf).await.unwrap();
                queries.push(Message::from_octets(buf).unwrap());
            }
            for query in queries.iter().rev() {
                let reply = answer_a(query, addr_for_name(query));
                write_frame(&mut stream, &reply).await.unwrap();
            }
        });

        let conn = dot::Connection::new([TcpConnect::new(server)]);
        let request1 = request("host1.example.com");
        let request2 = request("host2.example.com");
        let first = conn.request(&request1);
        let second = conn.request(&request2);
        let (first, second) = tokio::join!(first, second);

        let first = first.unwrap();
        let second = second.unwrap();
        let addr_of = |msg: &Message<bytes::Bytes>| {
            msg.answer()
                .unwrap()
                .limit_to::<domain::rdata::A>()
                .next()
                .unwrap()
                .unwrap()
                .data()
                .addr()
        };
        assert_eq!(addr_of(&first), Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(addr_of(&second), Ipv4Addr::new(198, 51, 100, 2));
    });
}

#[test]
fn reconnects_after_server_side_close() {
    init_logging();
    tokio_test::block_on(async {
        // The server drops every connection after a single answer.
        let server = spawn_tcp_server(
            Arc::new(|query| Some(answer_a(query, addr_for_name(query)))),
            Some(1),
        )
        .await;

        let conn = dot::Connection::new([TcpConnect::new(server)]);
        let first = conn.request(&request("host1.example.com")).await.unwrap();
        assert_eq!(first.header_counts().ancount(), 1);

        // The connection is gone now; the next request must transparently
        // get a fresh one.
        let second =
            conn.request(&request("host2.example.com")).await.unwrap();
        assert_eq!(second.header_counts().ancount(), 1);
    });
}

#[test]
fn fails_over_to_second_endpoint() {
    init_logging();
    tokio_test::block_on(async {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let live = spawn_tcp_server(
            Arc::new(|query| Some(answer_a(query, addr_for_name(query)))),
            None,
        )
        .await;

        let conn = dot::Connection::new([
            TcpConnect::new(dead),
            TcpConnect::new(live),
        ]);
        let answer = conn.request(&request("host1.example.com")).await.unwrap();
        assert_eq!(answer.header_counts().ancount(), 1);
    });
}

#[test]
fn nxdomain_respects_strict_rcode() {
    init_logging();
    tokio_test::block_on(async {
        let server = spawn_tcp_server(
            Arc::new(|query| Some(answer_rcode(query, Rcode::NXDOMAIN))),
            None,
        )
        .await;

        let strict = dot::Connection::new([TcpConnect::new(server)]);
        match strict.request(&request("emanon.foo")).await {
            Err(Error::ErrorResponse(rcode)) => {
                assert_eq!(rcode, Rcode::NXDOMAIN)
            }
            res => panic!("expected an error status, got {:?}", res),
        }

        let mut config = dot::Config::new();
        config.set_strict_rcode(false);
        let lenient =
            dot::Connection::with_config([TcpConnect::new(server)], config);
        let answer = lenient.request(&request("emanon.foo")).await.unwrap();
        assert_eq!(answer.header().rcode(), Rcode::NXDOMAIN);
    });
}

#[test]
fn unanswered_request_times_out() {
    init_logging();
    tokio_test::block_on(async {
        // The server accepts and reads but never answers.
        let server = spawn_tcp_server(Arc::new(|_| None), None).await;

        let mut config = dot::Config::new();
        config.set_timeout(Duration::from_millis(200));
        let conn =
            dot::Connection::with_config([TcpConnect::new(server)], config);
        match conn.request(&request("host1.example.com")).await {
            Err(Error::RequestTimedOut) => {}
            res => panic!("expected a timeout, got {:?}", res),
        }

        // The timed out request must not poison the connection.
        let server2 = spawn_tcp_server(
            Arc::new(|query| Some(answer_a(query, addr_for_name(query)))),
            None,
        )
        .await;
        let conn = dot::Connection::new([TcpConnect::new(server2)]);
        let answer = conn.request(&request("host1.example.com")).await.unwrap();
        assert_eq!(answer.header_counts().ancount(), 1);
    });
}

#[test]
fn no_endpoints_fails_immediately() {
    tokio_test::block_on(async {
        let conn = dot::Connection::new(
            Vec::<TcpConnect<std::net::SocketAddr>>::new(),
        );
        match conn.request(&request("example.com")).await {
            Err(Error::NoServers) => {}
            res => panic!("expected no-servers, got {:?}", res),
        }
    });
}
