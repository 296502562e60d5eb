#[allow(unused_imports)]
use std::ascii::AsciiExt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Async, Future, Poll};
use tk_bufstream::{IoBuf, ReadBuf, WriteBuf};
use tokio_core::reactor::{Handle, Timeout};
use tokio_io::{AsyncRead, AsyncWrite};

use director::{Connect, ProxyConnection};
use enums::Status;
use headers;
use io::Source;
use parser::{self, Events, Head, Parser};
use runtime::{Handler, Outcome};
use server::request::OutputState;
use server::{Config, Error, Request};
use server::error_page;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Reading and parsing the request head
    ReadingRequest,
    /// The handler ran; waiting for `finish()` (and reading the body)
    Handling,
    /// Request finished; draining queued sources to the socket
    WritingResponse,
    /// Between requests, idle timer armed
    KeepAlive,
    /// Flushing the last bytes before tearing the connection down
    Closing,
    Closed,
}

/// A low-level HTTP/1.x server connection without timers
///
/// This drives one client connection through its whole life. It owns the
/// socket buffers, the parser, at most one request and the upstream leg
/// anchored to that request. `Proto` wraps it with timeout arming; this
/// type is usable directly where no reactor is around (tests over mock
/// sockets).
pub struct PureProto<S, C: Connect> {
    inbuf: ReadBuf<S>,
    outbuf: WriteBuf<S>,
    parser: Parser,
    state: ConnState,
    request: Option<Request>,
    proxy: Option<ProxyConnection<C>>,
    request_complete: bool,
    handler: Arc<Handler>,
    connector: C,
    config: Arc<Config>,
    peer_addr: Option<SocketAddr>,
    last_byte: Instant,
    served: usize,
    body_sent: u64,
    body_overflowed: bool,
}

/// A server connection with read, write and keep-alive timers
pub struct Proto<S, C: Connect> {
    proto: PureProto<S, C>,
    handle: Handle,
    timeout: Option<Timeout>,
    deadline: Option<Instant>,
}

struct ConnEvents<'a, C: Connect + 'a> {
    config: &'a Arc<Config>,
    peer_addr: Option<SocketAddr>,
    allow_keepalive: bool,
    handler: &'a Arc<Handler>,
    request: &'a mut Option<Request>,
    proxy: &'a mut Option<ProxyConnection<C>>,
    state: &'a mut ConnState,
}

impl<'a, C: Connect + 'a> Events for ConnEvents<'a, C> {
    fn message_begin(&mut self, head: &Head) -> bool {
        if let Head::Request { method, target, version } = *head {
            *self.request = Some(Request::new(self.config, method, target,
                version, self.peer_addr, self.allow_keepalive));
        }
        true
    }

    fn header(&mut self, name: &str, value: &[u8]) -> bool {
        if let Some(ref mut req) = *self.request {
            if name.eq_ignore_ascii_case("Expect")
                && headers::is_continue(value)
            {
                req.note_expect_continue();
            }
            req.headers.push(name, value);
        }
        true
    }

    fn headers_end(&mut self) -> bool {
        *self.state = ConnState::Handling;
        let req = self.request.as_mut().expect("request was created");
        let outcome = self.handler.main(req);
        if let Some(director) = req.take_forward() {
            *self.proxy = Some(ProxyConnection::new(&director, req));
        } else if outcome == Outcome::Done && !req.is_finished() {
            // nothing claimed the request; finish() produces the error page
            req.finish();
        }
        true
    }

    fn content(&mut self, data: &[u8]) -> bool {
        if let Some(ref mut req) = *self.request {
            req.deliver_body(data, false);
        }
        true
    }

    fn message_end(&mut self) -> bool {
        if let Some(ref mut req) = *self.request {
            req.deliver_body(b"", true);
        }
        true
    }
}

impl<S: AsyncRead + AsyncWrite, C: Connect> PureProto<S, C> {
    pub fn new(conn: S, cfg: &Arc<Config>, handler: &Arc<Handler>,
        connector: C, peer_addr: Option<SocketAddr>)
        -> PureProto<S, C>
    {
        let (cout, cin) = IoBuf::new(conn).split();
        PureProto {
            inbuf: cin,
            outbuf: cout,
            parser: Parser::request()
                .limits(cfg.get_max_request_line(),
                        cfg.get_max_headers_size()),
            state: ConnState::ReadingRequest,
            request: None,
            proxy: None,
            request_complete: false,
            handler: handler.clone(),
            connector: connector,
            config: cfg.clone(),
            peer_addr: peer_addr,
            last_byte: Instant::now(),
            served: 0,
            body_sent: 0,
            body_overflowed: false,
        }
    }

    fn do_reads(&mut self) -> Result<bool, Error> {
        match self.state {
            ConnState::ReadingRequest | ConnState::Handling
            | ConnState::KeepAlive => {}
            _ => return Ok(false),
        }
        let mut progress = false;
        if self.inbuf.read()? > 0 {
            self.last_byte = Instant::now();
            progress = true;
        }
        let eof = self.inbuf.done();
        if self.state == ConnState::KeepAlive {
            if self.inbuf.in_buf.len() > 0 {
                self.state = ConnState::ReadingRequest;
                progress = true;
            } else if eof {
                self.state = ConnState::Closed;
                return Ok(true);
            } else {
                return Ok(progress);
            }
        }
        if !self.request_complete {
            let allow_keepalive = self.config.get_max_keepalive_requests()
                > self.served + 1;
            let result = {
                let mut events = ConnEvents {
                    config: &self.config,
                    peer_addr: self.peer_addr,
                    allow_keepalive: allow_keepalive,
                    handler: &self.handler,
                    request: &mut self.request,
                    proxy: &mut self.proxy,
                    state: &mut self.state,
                };
                self.parser.process(&mut self.inbuf.in_buf, eof,
                    &mut events)
            };
            match result {
                Ok(Async::Ready(())) => {
                    self.request_complete = true;
                    progress = true;
                }
                Ok(Async::NotReady) => {}
                Err(parser::Error::UnexpectedEof) => {
                    return Err(Error::ConnectionReset);
                }
                Err(e) => {
                    if self.state != ConnState::ReadingRequest {
                        // the request is already dispatched; its body is
                        // unreadable now, so the connection is lost
                        return Err(e.into());
                    }
                    info!("bad request: {}", e);
                    self.write_error_page(e.status());
                    return Ok(true);
                }
            }
        }
        if eof {
            match self.state {
                ConnState::ReadingRequest => {
                    if self.inbuf.in_buf.len() == 0
                        && self.request.is_none()
                    {
                        self.state = ConnState::Closed;
                        return Ok(true);
                    }
                    return Err(Error::ConnectionReset);
                }
                ConnState::Handling | ConnState::WritingResponse => {
                    return Err(Error::ConnectionReset);
                }
                _ => {}
            }
        }
        Ok(progress)
    }

    fn do_proxy(&mut self) -> Result<bool, Error> {
        if self.proxy.is_none() {
            return Ok(false);
        }
        let client_pending = self.outbuf.out_buf.len() > 0
            || self.request.as_ref()
                .map(|r| r.has_queued_output()).unwrap_or(false);
        let result = {
            let req = self.request.as_mut()
                .expect("a proxied request exists");
            self.proxy.as_mut().unwrap()
                .poll(req, &self.connector, client_pending)
        };
        match result {
            Ok(Async::Ready(())) => {
                self.proxy = None;
                Ok(true)
            }
            Ok(Async::NotReady) => Ok(false),
            Err(e) => Err(Error::Upstream(e)),
        }
    }

    fn do_writes(&mut self) -> Result<bool, Error> {
        let mut progress = false;
        if let Some(ref mut req) = self.request {
            if req.take_continue() {
                self.outbuf.out_buf
                    .write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
                progress = true;
            }
            if req.output_state() != OutputState::Unhandled {
                req.ensure_serialized();
                if let Some(head) = req.take_head_block() {
                    self.outbuf.out_buf.write_all(&head[..]).unwrap();
                    progress = true;
                }
                let drop_body = req.drops_body();
                let limit = req.body_limit();
                let watermark = self.config.get_output_watermark();
                loop {
                    if self.outbuf.out_buf.len() > watermark {
                        break;
                    }
                    let pulled = {
                        let queue = req.output_queue();
                        match queue.front_mut() {
                            Some(src) => match src.pull()? {
                                Async::Ready(Some(data)) => {
                                    if !drop_body {
                                        let mut slice = data;
                                        if let Some(limit) = limit {
                                            let left = limit
                                                .saturating_sub(
                                                    self.body_sent);
                                            if slice.len() as u64 > left {
                                                if !self.body_overflowed {
                                                    error!("response body \
                                                        exceeds the declared \
                                                        Content-Length of {}, \
                                                        truncating", limit);
                                                    self.body_overflowed =
                                                        true;
                                                }
                                                slice =
                                                    &slice[..left as usize];
                                            }
                                        }
                                        self.outbuf.out_buf
                                            .write_all(slice).unwrap();
                                        self.body_sent +=
                                            slice.len() as u64;
                                    }
                                    Some(true)
                                }
                                Async::Ready(None) => Some(false),
                                Async::NotReady => None,
                            },
                            None => break,
                        }
                    };
                    match pulled {
                        Some(true) => progress = true,
                        Some(false) => {
                            req.output_queue().pop_front();
                            progress = true;
                        }
                        None => break,
                    }
                }
            }
        }
        let before = self.outbuf.out_buf.len();
        self.outbuf.flush()?;
        if self.outbuf.out_buf.len() < before {
            self.last_byte = Instant::now();
            progress = true;
        }
        Ok(progress)
    }

    fn do_transitions(&mut self) -> Result<bool, Error> {
        match self.state {
            ConnState::Handling | ConnState::WritingResponse => {}
            ConnState::Closing => {
                if self.outbuf.out_buf.len() == 0 {
                    self.state = ConnState::Closed;
                    return Ok(true);
                }
                return Ok(false);
            }
            _ => return Ok(false),
        }
        let finished = self.request.as_ref()
            .map(|r| r.is_finished()).unwrap_or(false);
        if !finished {
            return Ok(false);
        }
        if self.state == ConnState::Handling {
            self.state = ConnState::WritingResponse;
            return Ok(true);
        }
        let drained = !self.request.as_ref().unwrap().has_queued_output()
            && self.outbuf.out_buf.len() == 0;
        if !drained {
            return Ok(false);
        }
        let req = self.request.take().unwrap();
        self.served += 1;
        self.body_sent = 0;
        self.body_overflowed = false;
        let keep = req.keep_alive() == Some(true)
            && self.request_complete
            && !req.is_aborted()
            && self.proxy.is_none();
        if keep {
            self.parser.reset();
            self.request_complete = false;
            self.last_byte = Instant::now();
            self.state = ConnState::KeepAlive;
        } else {
            self.state = ConnState::Closing;
        }
        Ok(true)
    }

    /// Emit a bare error response outside of any request and close
    fn write_error_page(&mut self, status: Status) {
        let body = error_page::default_body(status.code(), status.reason());
        let out = &mut self.outbuf.out_buf;
        write!(out, "HTTP/1.1 {} {}\r\n", status.code(), status.reason())
            .unwrap();
        write!(out, "Content-Type: text/html\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n", body.len()).unwrap();
        out.write_all(&body[..]).unwrap();
        self.state = ConnState::Closing;
    }

    /// Act on expired timers; true means something changed
    fn check_expiry(&mut self) -> Result<bool, Error> {
        let now = Instant::now();
        match self.state {
            ConnState::ReadingRequest => {
                if now >= self.last_byte + self.config.get_read_timeout() {
                    if self.inbuf.in_buf.len() > 0 {
                        self.write_error_page(Status::RequestTimeout);
                    } else {
                        self.state = ConnState::Closed;
                    }
                    return Ok(true);
                }
            }
            ConnState::Handling => {
                if !self.request_complete
                    && now >= self.last_byte
                        + self.config.get_read_timeout()
                {
                    return Err(Error::ReadTimeout);
                }
                if let Some(deadline) =
                    self.proxy.as_ref().map(|p| p.deadline())
                {
                    if now >= deadline {
                        self.do_proxy()?;
                        return Ok(true);
                    }
                }
            }
            ConnState::WritingResponse | ConnState::Closing => {
                if self.outbuf.out_buf.len() > 0
                    && now >= self.last_byte
                        + self.config.get_write_timeout()
                {
                    return Err(Error::WriteTimeout);
                }
            }
            ConnState::KeepAlive => {
                if now >= self.last_byte
                    + self.config.get_keep_alive_timeout()
                {
                    self.state = ConnState::Closed;
                    return Ok(true);
                }
            }
            ConnState::Closed => {}
        }
        Ok(false)
    }

    /// The next instant a timer wants this connection polled, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnState::ReadingRequest => {
                Some(self.last_byte + self.config.get_read_timeout())
            }
            ConnState::Handling => {
                let proxy = self.proxy.as_ref().map(|p| p.deadline());
                let read = if self.request_complete {
                    None
                } else {
                    Some(self.last_byte + self.config.get_read_timeout())
                };
                match (proxy, read) {
                    (Some(a), Some(b)) => Some(if a < b { a } else { b }),
                    (Some(a), None) => Some(a),
                    (None, b) => b,
                }
            }
            ConnState::WritingResponse | ConnState::Closing => {
                if self.outbuf.out_buf.len() > 0 {
                    Some(self.last_byte + self.config.get_write_timeout())
                } else {
                    None
                }
            }
            ConnState::KeepAlive => {
                Some(self.last_byte + self.config.get_keep_alive_timeout())
            }
            ConnState::Closed => None,
        }
    }
}

impl<S: AsyncRead + AsyncWrite, C: Connect> Future for PureProto<S, C> {
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<(), Error> {
        let result = self.poll_loop();
        if result.is_err() {
            // the abort path: the request learns about it exactly once,
            // then the connection is torn down
            if let Some(ref mut req) = self.request {
                req.abort();
            }
            self.state = ConnState::Closed;
        }
        result
    }
}

impl<S: AsyncRead + AsyncWrite, C: Connect> PureProto<S, C> {
    fn poll_loop(&mut self) -> Poll<(), Error> {
        loop {
            let mut progress = false;
            progress |= self.do_reads()?;
            progress |= self.do_proxy()?;
            progress |= self.do_writes()?;
            progress |= self.do_transitions()?;
            if self.state == ConnState::Closed {
                return Ok(Async::Ready(()));
            }
            if !progress {
                if self.check_expiry()? {
                    continue;
                }
                return Ok(Async::NotReady);
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite, C: Connect> Proto<S, C> {
    /// Create a new connection from an accepted socket
    pub fn new(conn: S, handle: &Handle, cfg: &Arc<Config>,
        handler: &Arc<Handler>, connector: C,
        peer_addr: Option<SocketAddr>)
        -> Proto<S, C>
    {
        Proto {
            proto: PureProto::new(conn, cfg, handler, connector, peer_addr),
            handle: handle.clone(),
            timeout: None,
            deadline: None,
        }
    }
}

impl<S: AsyncRead + AsyncWrite, C: Connect> Future for Proto<S, C> {
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<(), Error> {
        loop {
            let result = self.proto.poll();
            let deadline = self.proto.next_deadline();
            if deadline != self.deadline {
                self.deadline = deadline;
                self.timeout = deadline.map(|instant| {
                    let now = Instant::now();
                    let left = if instant > now {
                        instant - now
                    } else {
                        Duration::new(0, 0)
                    };
                    Timeout::new(left, &self.handle)
                        .expect("can always create a timeout")
                });
            }
            if let Some(ref mut timeout) = self.timeout {
                match timeout.poll().expect("timeout can't fail on poll") {
                    Async::Ready(()) => continue,
                    Async::NotReady => {}
                }
            }
            return result;
        }
    }
}
