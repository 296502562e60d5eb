extern crate futures;
extern crate tk_bufstream;
extern crate tk_gateway;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::Future;
use futures::future::{self, FutureResult};
use tk_bufstream::MockData;

use tk_gateway::director::{Backend, BackendAddr, Connect, Director};
use tk_gateway::runtime::{FnHandler, Handler, Outcome};
use tk_gateway::server::{Config, PureProto, Request};


/// Hands out a shared mock upstream socket, refusing configured ports
struct MockConnector {
    refuse_ports: Vec<u16>,
    upstream: MockData,
    response: String,
}

impl Connect for MockConnector {
    type Io = MockData;
    type Future = FutureResult<MockData, io::Error>;

    fn connect(&self, addr: &BackendAddr) -> Self::Future {
        match *addr {
            BackendAddr::Tcp(sock_addr) => {
                if self.refuse_ports.contains(&sock_addr.port()) {
                    future::err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused"))
                } else {
                    let sock = self.upstream.clone();
                    sock.add_input(&self.response[..]);
                    future::ok(sock)
                }
            }
            BackendAddr::Unix(..) => {
                future::err(io::Error::new(io::ErrorKind::Other,
                    "not supported"))
            }
        }
    }
}

fn tcp(port: u16) -> BackendAddr {
    BackendAddr::Tcp(format!("127.0.0.1:{}", port).parse().unwrap())
}

fn peer() -> SocketAddr {
    "192.0.2.7:55555".parse().unwrap()
}

fn forwarding_handler(director: Arc<Director>) -> Arc<Handler> {
    Arc::new(FnHandler::new(move |req: &mut Request| {
        req.forward(&director);
        Outcome::Pending
    }))
}

fn output(mock: &MockData) -> String {
    String::from_utf8_lossy(&mock.output(..)).to_string()
}

#[test]
fn failover_to_second_backend() {
    let director = Director::new()
        .add_backend(Backend::new("B1", tcp(9001), 1))
        .add_backend(Backend::new("B2", tcp(9002), 1))
        .done();
    let upstream = MockData::new();
    let connector = MockConnector {
        refuse_ports: vec![9001],
        upstream: upstream.clone(),
        response: "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\
                   Server: origin/1.0\r\nConnection: close\r\n\r\nworld"
            .to_string(),
    };
    let client = MockData::new();
    let cfg = Config::new().done();
    let handler = forwarding_handler(director.clone());
    let mut proto = PureProto::new(client.clone(), &cfg, &handler,
        connector, Some(peer()));
    client.add_input("GET /x HTTP/1.1\r\nHost: app\r\n\r\n");
    proto.poll().unwrap();

    let out = output(&client);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", out);
    assert!(out.contains("X-Director-Backend: B2\r\n"));
    // the origin's Content-Length is reused, so the body passes through
    // without re-framing
    assert!(out.contains("Content-Length: 5\r\n"));
    assert!(out.ends_with("world"), "got: {}", out);
    // origin's hop-by-hop and cloaked headers are gone
    assert!(!out.contains("origin/1.0"));
    assert!(!out.contains("Connection: close"));

    // the forwarded request carries the proxy headers
    let sent = output(&upstream);
    assert!(sent.starts_with("GET /x HTTP/1.1\r\n"), "sent: {}", sent);
    assert!(sent.contains("Host: app\r\n"));
    assert!(sent.contains("Connection: close\r\n"));
    assert!(sent.contains("X-Forwarded-For: 192.0.2.7\r\n"));
    assert!(sent.contains("X-Forwarded-Proto: http\r\n"));

    // attempt accounting: one failed try on B1, success on B2
    assert_eq!(director.backends()[0].hits(), 1);
    assert_eq!(director.backends()[1].hits(), 1);
    assert_eq!(director.backends()[0].active(), 0);
    assert_eq!(director.backends()[1].active(), 0);
    assert_eq!(director.inflight(), 0);
}

#[test]
fn all_backends_down_is_bad_gateway() {
    let director = Director::new()
        .add_backend(Backend::new("B1", tcp(9001), 1))
        .add_backend(Backend::new("B2", tcp(9002), 1))
        .done();
    let connector = MockConnector {
        refuse_ports: vec![9001, 9002],
        upstream: MockData::new(),
        response: String::new(),
    };
    let client = MockData::new();
    let cfg = Config::new().done();
    let handler = forwarding_handler(director.clone());
    let mut proto = PureProto::new(client.clone(), &cfg, &handler,
        connector, Some(peer()));
    client.add_input("GET / HTTP/1.1\r\nHost: app\r\n\r\n");
    proto.poll().unwrap();

    let out = output(&client);
    assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "got: {}", out);
    assert!(out.contains("<h1>502 Bad Gateway</h1>"));
    assert_eq!(out.matches("502 Bad Gateway\r\n").count(), 1);
    assert_eq!(director.inflight(), 0);
    assert_eq!(director.backends()[0].active(), 0);
    assert_eq!(director.backends()[1].active(), 0);
}

#[test]
fn request_body_is_relayed() {
    let director = Director::new()
        .add_backend(Backend::new("app", tcp(9009), 4))
        .done();
    let upstream = MockData::new();
    let connector = MockConnector {
        refuse_ports: vec![],
        upstream: upstream.clone(),
        response: "HTTP/1.1 204 No Content\r\n\r\n".to_string(),
    };
    let client = MockData::new();
    let cfg = Config::new().done();
    let handler = forwarding_handler(director.clone());
    let mut proto = PureProto::new(client.clone(), &cfg, &handler,
        connector, Some(peer()));
    client.add_input("POST /submit HTTP/1.1\r\nHost: app\r\n\
                      Content-Length: 5\r\n\r\nhello");
    proto.poll().unwrap();

    let sent = output(&upstream);
    assert!(sent.starts_with("POST /submit HTTP/1.1\r\n"), "sent: {}", sent);
    assert!(sent.contains("Content-Length: 5\r\n"));
    assert!(sent.ends_with("\r\n\r\nhello"), "sent: {}", sent);

    let out = output(&client);
    assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"), "got: {}", out);
    assert_eq!(director.backends()[0].hits(), 1);
    assert_eq!(director.backends()[0].active(), 0);
}

#[test]
fn expect_header_is_not_forwarded() {
    let director = Director::new()
        .add_backend(Backend::new("app", tcp(9009), 4))
        .done();
    let upstream = MockData::new();
    let connector = MockConnector {
        refuse_ports: vec![],
        upstream: upstream.clone(),
        response: "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
            .to_string(),
    };
    let client = MockData::new();
    let cfg = Config::new().done();
    let handler = forwarding_handler(director.clone());
    let mut proto = PureProto::new(client.clone(), &cfg, &handler,
        connector, Some(peer()));
    client.add_input("POST / HTTP/1.1\r\nHost: app\r\n\
                      Expect: 100-continue\r\nContent-Length: 5\r\n\r\n");
    proto.poll().unwrap();

    // installing the body consumer answers the expectation locally
    let out = output(&client);
    assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\n"),
        "got: {}", out);
    assert!(out.contains("HTTP/1.1 200 OK\r\n"), "got: {}", out);
    let sent = output(&upstream);
    assert!(!sent.contains("Expect"), "sent: {}", sent);
}

#[test]
fn existing_forwarded_for_is_extended() {
    let director = Director::new()
        .add_backend(Backend::new("app", tcp(9009), 4))
        .done();
    let upstream = MockData::new();
    let connector = MockConnector {
        refuse_ports: vec![],
        upstream: upstream.clone(),
        response: "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
            .to_string(),
    };
    let client = MockData::new();
    let cfg = Config::new().done();
    let handler = forwarding_handler(director.clone());
    let mut proto = PureProto::new(client.clone(), &cfg, &handler,
        connector, Some(peer()));
    client.add_input("GET / HTTP/1.1\r\nHost: app\r\n\
                      X-Forwarded-For: 198.51.100.1\r\n\r\n");
    proto.poll().unwrap();

    let sent = output(&upstream);
    assert!(sent.contains("X-Forwarded-For: 198.51.100.1, 192.0.2.7\r\n"),
        "sent: {}", sent);
    assert_eq!(sent.matches("X-Forwarded-For").count(), 1);
}

#[test]
fn cloaking_can_be_disabled() {
    let director = Director::new()
        .add_backend(Backend::new("app", tcp(9009), 4))
        .cloak_origin(false)
        .done();
    let upstream = MockData::new();
    let connector = MockConnector {
        refuse_ports: vec![],
        upstream: upstream.clone(),
        response: "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\
                   Server: origin/1.0\r\n\r\n".to_string(),
    };
    let client = MockData::new();
    let cfg = Config::new().done();
    let handler = forwarding_handler(director.clone());
    let mut proto = PureProto::new(client.clone(), &cfg, &handler,
        connector, Some(peer()));
    client.add_input("GET / HTTP/1.1\r\nHost: app\r\n\r\n");
    proto.poll().unwrap();

    let out = output(&client);
    assert!(out.contains("Server: origin/1.0\r\n"), "got: {}", out);
}
