//! Mock servers and message helpers shared by the transport tests.
#![allow(dead_code)]

use domain::base::iana::Rcode;
use domain::base::{Message, MessageBuilder, Name};
use domain::rdata::{Aaaa, Ptr, A};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the crate and the test suite.
///
/// Use the RUST_LOG environment variable to override the defaults.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}

/// How mock servers answer a decoded query.
pub type Responder =
    Arc<dyn Fn(&Message<Vec<u8>>) -> Option<Vec<u8>> + Send + Sync>;

//------------ Message helpers ------------------------------------------------

/// Builds a response for a query with a single A record.
pub fn answer_a(query: &Message<Vec<u8>>, addr: Ipv4Addr) -> Vec<u8> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_qr(true);
    msg.header_mut().set_id(query.header().id());
    let mut msg = msg.question();
    let question = query.first_question().unwrap();
    msg.push(question.clone()).unwrap();
    let mut msg = msg.answer();
    msg.push((question.into_qname(), 3600, A::new(addr))).unwrap();
    msg.into_message().into_octets()
}

/// Builds a response for a query with a single AAAA record.
pub fn answer_aaaa(query: &Message<Vec<u8>>, addr: Ipv6Addr) -> Vec<u8> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_qr(true);
    msg.header_mut().set_id(query.header().id());
    let mut msg = msg.question();
    let question = query.first_question().unwrap();
    msg.push(question.clone()).unwrap();
    let mut msg = msg.answer();
    msg.push((question.into_qname(), 3600, Aaaa::new(addr)))
        .unwrap();
    msg.into_message().into_octets()
}

/// Builds a response for a query with a single PTR record.
pub fn answer_ptr(query: &Message<Vec<u8>>, target: &str) -> Vec<u8> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_qr(true);
    msg.header_mut().set_id(query.header().id());
    let mut msg = msg.question();
    let question = query.first_question().unwrap();
    msg.push(question.clone()).unwrap();
    let mut msg = msg.answer();
    msg.push((
        question.into_qname(),
        3600,
        Ptr::new(Name::<Vec<u8>>::from_str(target).unwrap()),
    ))
    .unwrap();
    msg.into_message().into_octets()
}

/// Builds an empty response with the given status.
pub fn answer_rcode(query: &Message<Vec<u8>>, rcode: Rcode) -> Vec<u8> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_qr(true);
    msg.header_mut().set_id(query.header().id());
    msg.header_mut().set_rcode(rcode);
    let mut msg = msg.question();
    msg.push(query.first_question().unwrap()).unwrap();
    msg.into_message().into_octets()
}

/// Builds an empty truncated response, as a UDP server under pressure would.
pub fn answer_truncated(query: &Message<Vec<u8>>) -> Vec<u8> {
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_qr(true);
    msg.header_mut().set_id(query.header().id());
    msg.header_mut().set_tc(true);
    let mut msg = msg.question();
    msg.push(query.first_question().unwrap()).unwrap();
    msg.into_message().into_octets()
}

//------------ Mock servers ---------------------------------------------------

/// Runs a UDP responder on a random loopback port.
pub async fn spawn_udp_server(respond: Responder) -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(serve_udp(sock, respond));
    addr
}

/// The receive loop of a UDP responder.
async fn serve_udp(sock: UdpSocket, respond: Responder) {
    let mut buf = vec![0u8; 2000];
    loop {
        let (len, peer) = match sock.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => break,
        };
        let query = match Message::from_octets(buf[..len].to_vec()) {
            Ok(query) => query,
            Err(_) => continue,
        };
        if let Some(reply) = respond(&query) {
            let _ = sock.send_to(&reply, peer).await;
        }
    }
}

/// Runs a length-prefix framed TCP responder on a random loopback port.
///
/// Connections are served one query at a time until the client closes.
/// When `close_after` is given the connection is dropped after that many
/// answers, which is how a server-side idle teardown looks to a client.
pub async fn spawn_tcp_server(
    respond: Responder,
    close_after: Option<usize>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(serve_tcp(stream, respond.clone(), close_after));
        }
    });
    addr
}

/// Serves framed queries on one TCP connection.
async fn serve_tcp(
    mut stream: TcpStream,
    respond: Responder,
    close_after: Option<usize>,
) {
    let mut answered = 0;
    loop {
        let len = match stream.read_u16().await {
            Ok(len) => len as usize,
            Err(_) => return,
        };
        let mut buf = vec![0u8; len];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        let query = match Message::from_octets(buf) {
            Ok(query) => query,
            Err(_) => continue,
        };
        if let Some(reply) = respond(&query) {
            if write_frame(&mut stream, &reply).await.is_err() {
                return;
            }
            answered += 1;
            if close_after == Some(answered) {
                return;
            }
        }
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame(
    stream: &mut TcpStream,
    body: &[u8],
) -> std::io::Result<()> {
    let mut frame = (body.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Runs UDP and TCP responders on the same loopback port.
///
/// This is the shape of a real Do53 server: one service, both sockets.
pub async fn spawn_do53_server(
    udp_respond: Responder,
    tcp_respond: Responder,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sock = UdpSocket::bind(addr).await.unwrap();
    tokio::spawn(serve_udp(sock, udp_respond));
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(serve_tcp(stream, tcp_respond.clone(), None));
        }
    });
    addr
}

//------------ Mock DoH server ------------------------------------------------

/// What the HTTP responder sends back.
pub struct HttpReply {
    /// The HTTP status code.
    pub status: u16,

    /// The value of the Content-Type header.
    pub content_type: &'static str,

    /// The response body.
    pub body: Vec<u8>,
}

/// How the HTTP mock answers a decoded query.
pub type HttpResponder =
    Arc<dyn Fn(&Message<Vec<u8>>) -> HttpReply + Send + Sync>;

/// Runs a minimal HTTP/1.1 DoH responder on a random loopback port.
pub async fn spawn_http_server(respond: HttpResponder) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(serve_http(stream, respond.clone()));
        }
    });
    addr
}

/// Serves a single HTTP request and closes the connection.
async fn serve_http(mut stream: TcpStream, respond: HttpResponder) {
    // Read the head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read_exact(&mut byte).await {
            Ok(_) => head.push(byte[0]),
            Err(_) => return,
        }
        if head.len() > 16384 {
            return;
        }
    }
    let head = String::from_utf8_lossy(&head);
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if stream.read_exact(&mut body).await.is_err() {
        return;
    }

    let reply = match Message::from_octets(body) {
        Ok(query) => respond(&query),
        Err(_) => HttpReply {
            status: 400,
            content_type: "text/plain",
            body: b"bad request".to_vec(),
        },
    };

    let head = format!(
        "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n",
        reply.status,
        reply.content_type,
        reply.body.len(),
    );
    let mut response = head.into_bytes();
    response.extend_from_slice(&reply.body);
    let _ = stream.write_all(&response).await;
    let _ = stream.flush().await;
}
