#[allow(unused_imports)]
use std::ascii::AsciiExt;
use std::cell::RefCell;
use std::io::Write;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use futures::{Async, Future};
use netbuf::Buf;
use tk_bufstream::{IoBuf, ReadBuf, WriteBuf};
use tokio_io::{AsyncRead, AsyncWrite};

use director::{Backend, Connect, Director, Ledger, Schedule};
use enums::Version;
use headers;
use io::{BufferSource, Filter, ChunkedEncoder};
use parser::{self, Events, Head, Parser};
use serializer;
use server::Request;


quick_error! {
    #[derive(Debug)]
    /// Upstream failures that cannot be retried or papered over
    ///
    /// By the time one of these is raised, response bytes have already
    /// reached the client, so the only way out is closing the client
    /// connection ungracefully.
    pub enum Error {
        Upstream(err: ::std::io::Error) {
            description("upstream I/O error")
            display("upstream I/O error: {}", err)
        }
        UpstreamSyntax(err: parser::Error) {
            description("malformed upstream response")
            display("malformed upstream response: {}", err)
        }
    }
}

enum IoState<C: Connect> {
    Connecting(C::Future),
    Streaming(WriteBuf<C::Io>, ReadBuf<C::Io>),
    Void,
}

struct Attempt<C: Connect> {
    backend: Arc<Backend>,
    state: IoState<C>,
    parser: Parser,
    /// Bytes of the body relay already handed to this attempt's socket
    sent: usize,
    started: Instant,
}

enum AttemptPoll {
    Progress,
    Blocked,
    /// The attempt failed before a valid upstream status; reschedule
    Failed,
    /// The upstream response was fully proxied
    Finished,
    /// Upstream died mid-body after the status; finish what we have
    Truncated,
    ClientAbort(Error),
}

/// Per-forwarded-request upstream state
///
/// Owned and polled by the client connection, which also owns the
/// `Request`; destruction of this object either released the backend (a
/// status was proxied) or was preceded by rescheduling. The request body
/// is kept in a replayable relay buffer so that a retried backend gets
/// the chunks an earlier attempt already consumed.
pub struct ProxyConnection<C: Connect> {
    director: Arc<Director>,
    ledger: Ledger,
    head: Buf,
    relay: Rc<RefCell<Buf>>,
    attempt: Option<Attempt<C>>,
    failed: Option<Arc<Backend>>,
    forwarded: bool,
    status_seen: bool,
    done: bool,
}

struct ProxyEvents<'a> {
    req: &'a mut Request,
    backend_name: &'a str,
    cloak: bool,
    forwarded: &'a mut bool,
    status_seen: &'a mut bool,
}

impl<'a> Events for ProxyEvents<'a> {
    fn message_begin(&mut self, head: &Head) -> bool {
        if let Head::Response { code, reason, .. } = *head {
            self.req.set_raw_status(code, reason);
            *self.status_seen = true;
        }
        true
    }

    fn header(&mut self, name: &str, value: &[u8]) -> bool {
        if name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            return true;
        }
        if self.cloak && name.eq_ignore_ascii_case("Server") {
            return true;
        }
        self.req.push_response_header(name, value);
        true
    }

    fn headers_end(&mut self) -> bool {
        self.req.push_response_header("X-Director-Backend",
            self.backend_name.as_bytes());
        true
    }

    fn content(&mut self, data: &[u8]) -> bool {
        self.req.write(BufferSource::copy(data));
        *self.forwarded = true;
        true
    }

    fn message_end(&mut self) -> bool {
        true
    }
}

impl<C: Connect> ProxyConnection<C> {
    /// Set up forwarding of a request through a director
    ///
    /// Assembles the forwarded head, attaches the body relay and leaves
    /// backend selection to the first `poll`.
    pub fn new(director: &Arc<Director>, req: &mut Request)
        -> ProxyConnection<C>
    {
        let relay_chunked = req.header("Transfer-Encoding")
            .map(|v| headers::is_chunked(v)).unwrap_or(false);
        let head = build_head(req, relay_chunked);
        let relay = Rc::new(RefCell::new(Buf::new()));
        {
            let relay = relay.clone();
            let encode = relay_chunked;
            req.set_body_callback(move |_req, data, end| {
                let mut buf = relay.borrow_mut();
                if encode {
                    let framed = ChunkedEncoder.process(data, end);
                    buf.write_all(&framed[..]).unwrap();
                } else {
                    buf.write_all(data).unwrap();
                }
            });
        }
        ProxyConnection {
            director: director.clone(),
            ledger: Ledger::new(),
            head: head,
            relay: relay,
            attempt: None,
            failed: None,
            forwarded: false,
            status_seen: false,
            done: false,
        }
    }

    /// When the surrounding connection should wake us up at the latest
    pub fn deadline(&self) -> Instant {
        let cap = self.ledger.started + self.director.retry_timeout;
        if let Some(ref attempt) = self.attempt {
            if matches!(attempt.state, IoState::Connecting(..)) {
                let connect = attempt.started
                    + self.director.connect_timeout;
                if connect < cap {
                    return connect;
                }
            }
        }
        cap
    }

    /// Drive the upstream leg
    ///
    /// `client_pending` pauses upstream reads while the client-facing
    /// side still has unflushed response bytes. `Ready` means the client
    /// request was finished one way or the other; an error means the
    /// client connection must be torn down.
    pub fn poll(&mut self, req: &mut Request, connector: &C,
        client_pending: bool)
        -> Result<Async<()>, Error>
    {
        if self.done {
            return Ok(Async::Ready(()));
        }
        loop {
            if self.attempt.is_none() {
                let failed = self.failed.take();
                match self.director.reschedule(&mut self.ledger,
                                               failed.as_ref())
                {
                    Schedule::Backend(backend) => {
                        debug!("forwarding to backend {} (attempt {})",
                            backend.name(), self.ledger.attempts());
                        let future = connector.connect(backend.addr());
                        let head_request = req.method == "HEAD";
                        self.attempt = Some(Attempt {
                            backend: backend,
                            state: IoState::Connecting(future),
                            parser: Parser::response(head_request),
                            sent: 0,
                            started: Instant::now(),
                        });
                    }
                    Schedule::GiveUp(status) => {
                        info!("giving up on request after {} attempts: {}",
                            self.ledger.attempts(), status.code());
                        req.set_status(status);
                        req.finish();
                        self.done = true;
                        return Ok(Async::Ready(()));
                    }
                }
            }
            match self.poll_attempt(req, client_pending) {
                AttemptPoll::Progress => continue,
                AttemptPoll::Blocked => return Ok(Async::NotReady),
                AttemptPoll::Failed => {
                    let attempt = self.attempt.take()
                        .expect("attempt is present");
                    self.failed = Some(attempt.backend);
                    continue;
                }
                AttemptPoll::Finished | AttemptPoll::Truncated => {
                    let attempt = self.attempt.take()
                        .expect("attempt is present");
                    self.director.release(&attempt.backend);
                    if !req.is_finished() {
                        req.finish();
                    }
                    self.done = true;
                    return Ok(Async::Ready(()));
                }
                AttemptPoll::ClientAbort(err) => {
                    return Err(err);
                }
            }
        }
    }

    fn poll_attempt(&mut self, req: &mut Request, client_pending: bool)
        -> AttemptPoll
    {
        let ProxyConnection {
            ref mut attempt,
            ref director,
            ref ledger,
            ref head,
            ref relay,
            ref mut forwarded,
            ref mut status_seen,
            ..
        } = *self;
        let attempt = attempt.as_mut().expect("attempt is present");
        let past_deadline =
            ledger.started.elapsed() >= director.retry_timeout;
        match mem::replace(&mut attempt.state, IoState::Void) {
            IoState::Connecting(mut future) => {
                match future.poll() {
                    Ok(Async::Ready(sock)) => {
                        let (mut wr, rd) = IoBuf::new(sock).split();
                        wr.out_buf.write_all(&head[..]).unwrap();
                        attempt.state = IoState::Streaming(wr, rd);
                        AttemptPoll::Progress
                    }
                    Ok(Async::NotReady) => {
                        let timeout = attempt.started
                            + director.connect_timeout;
                        if past_deadline || timeout <= Instant::now() {
                            debug!("connect to {} timed out",
                                attempt.backend.name());
                            return AttemptPoll::Failed;
                        }
                        attempt.state = IoState::Connecting(future);
                        AttemptPoll::Blocked
                    }
                    Err(e) => {
                        debug!("connect to {} failed: {}",
                            attempt.backend.name(), e);
                        AttemptPoll::Failed
                    }
                }
            }
            IoState::Streaming(mut wr, mut rd) => {
                let mut progress = false;
                {
                    let relay = relay.borrow();
                    if attempt.sent < relay.len() {
                        wr.out_buf.write_all(&relay[attempt.sent..])
                            .unwrap();
                        attempt.sent = relay.len();
                        progress = true;
                    }
                }
                if let Err(e) = wr.flush() {
                    debug!("write to {} failed: {}",
                        attempt.backend.name(), e);
                    return if *status_seen {
                        AttemptPoll::Truncated
                    } else {
                        AttemptPoll::Failed
                    };
                }
                if !client_pending {
                    match rd.read() {
                        Ok(0) => {}
                        Ok(_) => progress = true,
                        Err(e) => {
                            debug!("read from {} failed: {}",
                                attempt.backend.name(), e);
                            return if *status_seen {
                                AttemptPoll::Truncated
                            } else {
                                AttemptPoll::Failed
                            };
                        }
                    }
                    let eof = rd.done();
                    let result = {
                        let mut events = ProxyEvents {
                            req: req,
                            backend_name: attempt.backend.name(),
                            cloak: director.cloak_origin,
                            forwarded: forwarded,
                            status_seen: status_seen,
                        };
                        attempt.parser.process(&mut rd.in_buf, eof,
                            &mut events)
                    };
                    match result {
                        Ok(Async::Ready(())) => {
                            // message complete; upstream socket is
                            // dropped here, which closes it
                            return AttemptPoll::Finished;
                        }
                        Ok(Async::NotReady) => {
                            if eof {
                                // closed before the status line
                                return AttemptPoll::Failed;
                            }
                        }
                        Err(e) => {
                            return match e {
                                parser::Error::UnexpectedEof
                                    if *status_seen
                                => AttemptPoll::Truncated,
                                _ if !*status_seen && !*forwarded
                                => AttemptPoll::Failed,
                                _ => AttemptPoll::ClientAbort(
                                    Error::UpstreamSyntax(e)),
                            };
                        }
                    }
                }
                if past_deadline {
                    return if *status_seen {
                        AttemptPoll::Truncated
                    } else {
                        AttemptPoll::Failed
                    };
                }
                attempt.state = IoState::Streaming(wr, rd);
                if progress {
                    AttemptPoll::Progress
                } else {
                    AttemptPoll::Blocked
                }
            }
            IoState::Void => unreachable!(),
        }
    }
}

/// Assemble the forwarded request head
///
/// Hop-by-hop and proxy-internal headers are stripped; the forwarding
/// headers are appended after the copied ones.
fn build_head(req: &Request, body_chunked: bool) -> Buf {
    let mut buf = Buf::new();
    serializer::request_line(&mut buf, &req.method, &req.target,
        Version::Http11);
    let mut forwarded_for: Option<Vec<u8>> = None;
    for &(ref name, ref value) in req.headers.iter() {
        if name.eq_ignore_ascii_case("X-Forwarded-For") {
            forwarded_for = Some(value.clone());
            continue;
        }
        if name.eq_ignore_ascii_case("Content-Transfer")
            || name.eq_ignore_ascii_case("Expect")
            || name.eq_ignore_ascii_case("Connection")
        {
            continue;
        }
        if body_chunked && name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if let Err(e) = serializer::header(&mut buf, name, value) {
            warn!("not forwarding malformed header {:?}: {}", name, e);
        }
    }
    serializer::header(&mut buf, "Connection", b"close").unwrap();
    let mut forwarded = forwarded_for.unwrap_or_else(Vec::new);
    if let Some(addr) = req.peer_addr {
        if !forwarded.is_empty() {
            forwarded.extend_from_slice(b", ");
        }
        forwarded.extend_from_slice(format!("{}", addr.ip()).as_bytes());
    }
    if !forwarded.is_empty() {
        serializer::header(&mut buf, "X-Forwarded-For", &forwarded)
            .unwrap();
    }
    if req.header("X-Forwarded-Proto").is_none() {
        serializer::header(&mut buf, "X-Forwarded-Proto", b"http")
            .unwrap();
    }
    serializer::end_head(&mut buf);
    buf
}
