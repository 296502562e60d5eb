extern crate futures;
extern crate tk_bufstream;
extern crate tk_gateway;

use std::io;
use std::sync::{Arc, Mutex};

use futures::Future;
use futures::future::{self, FutureResult};
use tk_bufstream::MockData;

use tk_gateway::Status;
use tk_gateway::director::{BackendAddr, Connect};
use tk_gateway::io::BufferSource;
use tk_gateway::runtime::{FnHandler, Handler, Outcome};
use tk_gateway::server::{Config, PureProto, Request};


/// Connector for tests that never proxy
struct NoConnector;

impl Connect for NoConnector {
    type Io = MockData;
    type Future = FutureResult<MockData, io::Error>;
    fn connect(&self, _addr: &BackendAddr) -> Self::Future {
        future::err(io::Error::new(io::ErrorKind::Other,
            "no upstream in this test"))
    }
}

fn serve<F>(input: &str, f: F) -> (MockData, PureProto<MockData, NoConnector>)
    where F: Fn(&mut Request) -> Outcome + Send + Sync + 'static
{
    let mock = MockData::new();
    let cfg = Config::new().done();
    let handler: Arc<Handler> = Arc::new(FnHandler::new(f));
    let mut proto = PureProto::new(mock.clone(), &cfg, &handler,
        NoConnector, None);
    mock.add_input(input);
    proto.poll().unwrap();
    (mock, proto)
}

fn output(mock: &MockData) -> String {
    String::from_utf8_lossy(&mock.output(..)).to_string()
}

#[test]
fn http10_gets_length_and_closes() {
    let (mock, _proto) = serve("GET / HTTP/1.0\r\nHost: x\r\n\r\n", |req| {
        req.set_status(Status::Ok);
        req.write(BufferSource::copy(b"hi"));
        req.finish();
        Outcome::Done
    });
    let out = output(&mock);
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "got: {}", out);
    assert!(out.contains("Content-Length: 2\r\n"));
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with("hi"));
}

#[test]
fn http11_chunked_keepalive() {
    let (mock, mut proto) = serve(
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        |req| {
            req.set_status(Status::Ok);
            req.write(BufferSource::copy(b"abc"));
            req.finish();
            Outcome::Done
        });
    let out = output(&mock);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", out);
    assert!(out.contains("Transfer-Encoding: chunked\r\n"));
    assert!(out.contains("Connection: keep-alive\r\n"));
    assert!(out.ends_with("3\r\nabc\r\n0\r\n\r\n"));

    // the connection stays open and serves the next request
    let first_len = out.len();
    mock.add_input("GET /again HTTP/1.1\r\nHost: x\r\n\r\n");
    proto.poll().unwrap();
    let out = output(&mock);
    assert!(out[first_len..].starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn expect_continue_flow() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let seen = collected.clone();
    let (mock, mut proto) = serve(
        "POST / HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n\
         Content-Length: 5\r\n\r\n",
        move |req| {
            let seen = seen.clone();
            req.set_body_callback(move |req, data, end| {
                seen.lock().unwrap().extend_from_slice(data);
                if end {
                    req.set_status(Status::Ok);
                    req.overwrite_response_header("Content-Length",
                        &b"2"[..]);
                    req.write(BufferSource::copy(b"ok"));
                    req.finish();
                }
            });
            Outcome::Pending
        });
    let out = output(&mock);
    assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\n"),
        "got: {}", out);
    assert!(!out.contains("200"));

    mock.add_input("hello");
    proto.poll().unwrap();
    assert_eq!(&collected.lock().unwrap()[..], b"hello");
    let out = output(&mock);
    assert!(out.contains("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("ok"));
}

#[test]
fn head_response_has_no_body() {
    let (mock, _proto) = serve("HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", |req| {
        req.set_status(Status::Ok);
        req.push_response_header("Content-Length", &b"4"[..]);
        req.write(BufferSource::copy(b"body"));
        req.finish();
        Outcome::Done
    });
    let out = output(&mock);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Length: 4\r\n"));
    assert!(out.ends_with("\r\n\r\n"), "unexpected body bytes: {}", out);
}

#[test]
fn malformed_request_gets_400() {
    let (mock, _proto) = serve("GET\r\n", |_req| Outcome::Done);
    let out = output(&mock);
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {}", out);
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.contains("<h1>400 Bad Request</h1>"));
}

#[test]
fn unhandled_request_gets_404_page() {
    let (mock, _proto) = serve("GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n",
        |_req| Outcome::Done);
    let out = output(&mock);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", out);
    assert!(out.contains("Content-Type: text/html\r\n"));
    assert!(out.contains(
        "<head><title>404 Not Found</title></head>"));
    assert!(out.contains("<h1>404 Not Found</h1>"));
}

#[test]
fn pipelined_requests_are_served_in_order() {
    let (mock, mut proto) = serve(
        "GET /one HTTP/1.1\r\nHost: x\r\n\r\n\
         GET /two HTTP/1.1\r\nHost: x\r\n\r\n",
        |req| {
            let body = req.path.clone().into_bytes();
            req.set_status(Status::Ok);
            req.overwrite_response_header("Content-Length",
                format!("{}", body.len()).into_bytes());
            req.write(BufferSource::copy(&body));
            req.finish();
            Outcome::Done
        });
    proto.poll().unwrap();
    let out = output(&mock);
    let one = out.find("/one").expect("first response");
    let two = out.find("/two").expect("second response");
    assert!(one < two);
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
}

#[test]
fn overlong_fixed_body_is_truncated() {
    // writing more bytes than the declared Content-Length is a
    // programming error; the excess must not desynchronize the next
    // response on the keep-alive connection
    let (mock, mut proto) = serve(
        "GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
         GET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        |req| {
            req.set_status(Status::Ok);
            req.overwrite_response_header("Content-Length", &b"4"[..]);
            req.write(BufferSource::copy(b"0123456789"));
            req.finish();
            Outcome::Done
        });
    proto.poll().unwrap();
    let out = output(&mock);
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
    // the first body stops at the declared length and the second
    // response starts right after it
    assert!(out.contains("\r\n\r\n0123HTTP/1.1 200 OK\r\n"), "got: {}", out);
    assert!(!out.contains("456789"));
    assert!(out.ends_with("0123"));
}

#[test]
fn keepalive_disabled_by_config() {
    let mock = MockData::new();
    let cfg = Config::new().max_keepalive_requests(0).done();
    let handler: Arc<Handler> = Arc::new(FnHandler::new(
        |req: &mut Request| {
            req.set_status(Status::Ok);
            req.overwrite_response_header("Content-Length", &b"0"[..]);
            req.finish();
            Outcome::Done
        }));
    let mut proto = PureProto::new(mock.clone(), &cfg, &handler,
        NoConnector, None);
    mock.add_input("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    proto.poll().unwrap();
    let out = output(&mock);
    assert!(out.contains("Connection: close\r\n"), "got: {}", out);
}
