use std::str::from_utf8;
#[allow(unused_imports)]
use std::ascii::AsciiExt;

use futures::Async;
use httparse;
use netbuf::Buf;

use enums::{Status, Version};
use body_parser::BodyProgress;
use chunked;
use headers;


/// Number of headers to allocate on a stack
const MIN_HEADERS: usize = 16;
/// A hard limit on the number of headers
const MAX_HEADERS: usize = 1024;

const DEFAULT_MAX_REQUEST_LINE: usize = 8192;
const DEFAULT_MAX_HEADERS_SIZE: usize = 65536;


quick_error! {
    #[derive(Debug)]
    pub enum Error {
        Syntax(err: httparse::Error) {
            description("malformed message head")
            display("malformed message head: {:?}", err)
            from()
        }
        ChunkSize(err: httparse::InvalidChunkSize) {
            description("invalid chunk size")
            from()
        }
        RequestLineTooLong {
            description("request line exceeds the configured limit")
        }
        HeadersTooLarge {
            description("header block exceeds the configured limit")
        }
        BadContentLength {
            description("invalid content-length header")
        }
        DuplicateContentLength {
            description("duplicate content-length header")
        }
        UnexpectedEof {
            description("connection closed in the middle of a message")
        }
    }
}

impl Error {
    /// The status code this parse error maps to
    pub fn status(&self) -> Status {
        match *self {
            Error::HeadersTooLarge => Status::RequestHeaderFieldsTooLarge,
            _ => Status::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Request,
    Response,
}

/// Borrowed view of a parsed request or status line
///
/// Slices are valid only for the duration of the `message_begin` callback;
/// copy whatever you need to keep.
#[derive(Debug)]
pub enum Head<'a> {
    Request {
        method: &'a str,
        target: &'a str,
        version: Version,
    },
    Response {
        version: Version,
        code: u16,
        reason: &'a str,
    },
}

/// Message events delivered by the parser, in wire order
///
/// For every successfully parsed message the sequence is `message_begin`,
/// one `header` per header line, `headers_end`, zero or more `content`
/// calls, `message_end`. Returning false from any callback terminates
/// parsing; no further events are delivered.
pub trait Events {
    fn message_begin(&mut self, head: &Head) -> bool;
    fn header(&mut self, name: &str, value: &[u8]) -> bool;
    fn headers_end(&mut self) -> bool {
        true
    }
    fn content(&mut self, data: &[u8]) -> bool;
    fn message_end(&mut self) -> bool;
}

#[derive(Debug)]
enum State {
    Head,
    Body(BodyProgress),
    Done,
    Terminated,
}

/// An incremental HTTP/1.x message parser
///
/// The parser consumes bytes from the front of the buffer passed to
/// `process` and keeps no references into it between calls. Bytes past the
/// end of the current message (a pipelined follow-up request) are left in
/// the buffer.
#[derive(Debug)]
pub struct Parser {
    mode: Mode,
    head_request: bool,
    state: State,
    max_request_line: usize,
    max_headers_size: usize,
}

fn version_of(minor: u8) -> Version {
    if minor == 1 { Version::Http11 } else { Version::Http10 }
}

/// Body framing of a request per RFC 7230: chunked transfer-coding wins,
/// then content-length, otherwise there is no body.
fn request_body(raw_headers: &[httparse::Header])
    -> Result<BodyProgress, Error>
{
    let mut has_content_length = false;
    let mut body = BodyProgress::Fixed(0);
    for header in raw_headers.iter() {
        if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
            if headers::is_chunked(header.value) {
                body = BodyProgress::Chunked(chunked::State::new());
            }
        } else if header.name.eq_ignore_ascii_case("Content-Length") {
            if has_content_length {
                return Err(Error::DuplicateContentLength);
            }
            has_content_length = true;
            if !matches!(body, BodyProgress::Chunked(..)) {
                let s = from_utf8(header.value)
                    .map_err(|_| Error::BadContentLength)?;
                let len = s.trim().parse()
                    .map_err(|_| Error::BadContentLength)?;
                body = BodyProgress::Fixed(len);
            }
        }
    }
    Ok(body)
}

/// Body framing of a response: no body for HEAD and 1xx/204/304, then the
/// request rules, with read-until-EOF as the fallback.
fn response_body(head_request: bool, code: u16,
    raw_headers: &[httparse::Header])
    -> Result<BodyProgress, Error>
{
    if head_request || (code >= 100 && code < 200)
        || code == 204 || code == 304
    {
        return Ok(BodyProgress::Fixed(0));
    }
    let mut has_content_length = false;
    let mut body = BodyProgress::Eof;
    for header in raw_headers.iter() {
        if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
            if headers::is_chunked(header.value) {
                body = BodyProgress::Chunked(chunked::State::new());
            }
        } else if header.name.eq_ignore_ascii_case("Content-Length") {
            if has_content_length {
                return Err(Error::DuplicateContentLength);
            }
            has_content_length = true;
            if !matches!(body, BodyProgress::Chunked(..)) {
                let s = from_utf8(header.value)
                    .map_err(|_| Error::BadContentLength)?;
                let len = s.trim().parse()
                    .map_err(|_| Error::BadContentLength)?;
                body = BodyProgress::Fixed(len);
            }
        }
    }
    Ok(body)
}

impl Parser {
    /// Create a parser for inbound requests
    pub fn request() -> Parser {
        Parser {
            mode: Mode::Request,
            head_request: false,
            state: State::Head,
            max_request_line: DEFAULT_MAX_REQUEST_LINE,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
        }
    }

    /// Create a parser for a response
    ///
    /// `head_request` must be true when the request this response answers
    /// was a HEAD request, because such responses carry no body regardless
    /// of their headers.
    pub fn response(head_request: bool) -> Parser {
        Parser {
            mode: Mode::Response,
            head_request: head_request,
            state: State::Head,
            max_request_line: DEFAULT_MAX_REQUEST_LINE,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
        }
    }

    /// Override the head size limits
    pub fn limits(mut self, max_request_line: usize, max_headers_size: usize)
        -> Parser
    {
        self.max_request_line = max_request_line;
        self.max_headers_size = max_headers_size;
        self
    }

    /// Prepare for the next message on the same connection
    pub fn reset(&mut self) {
        self.state = State::Head;
    }

    /// True once a full message was parsed
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// True when a callback stopped the parser
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, State::Terminated)
    }

    /// Feed buffered bytes through the parser
    ///
    /// Consumed bytes are removed from the front of `buf`. `end` tells
    /// that the peer closed its sending side. Returns `Ready` when a full
    /// message was parsed (call `reset` before reusing the parser).
    pub fn process<E: Events>(&mut self, buf: &mut Buf, end: bool,
        events: &mut E)
        -> Result<Async<()>, Error>
    {
        loop {
            match self.state {
                State::Head => {
                    match self.parse_head(buf, events)? {
                        Some(state) => {
                            self.state = state;
                            continue;
                        }
                        None => {
                            if end && buf.len() > 0 {
                                return Err(Error::UnexpectedEof);
                            }
                            return Ok(Async::NotReady);
                        }
                    }
                }
                State::Body(ref mut progress) => {
                    progress.parse(buf)?;
                    let (bytes, done) = progress.check_buf(buf, end);
                    if bytes > 0 {
                        let keep_going = events.content(&buf[..bytes]);
                        progress.consume(buf, bytes);
                        if !keep_going {
                            self.state = State::Terminated;
                            return Ok(Async::NotReady);
                        }
                    }
                    if done {
                        let keep_going = events.message_end();
                        self.state = if keep_going {
                            State::Done
                        } else {
                            State::Terminated
                        };
                        continue;
                    }
                    if end {
                        return Err(Error::UnexpectedEof);
                    }
                    return Ok(Async::NotReady);
                }
                State::Done => return Ok(Async::Ready(())),
                State::Terminated => return Ok(Async::NotReady),
            }
        }
    }

    fn parse_head<E: Events>(&mut self, buf: &mut Buf, events: &mut E)
        -> Result<Option<State>, Error>
    {
        let (body, consumed, keep_going) = {
            let mut vec;
            let mut stack_headers = [httparse::EMPTY_HEADER; MIN_HEADERS];
            match self.mode {
                Mode::Request => {
                    let mut raw =
                        httparse::Request::new(&mut stack_headers);
                    let mut result = raw.parse(&buf[..]);
                    if matches!(result,
                        Err(httparse::Error::TooManyHeaders))
                    {
                        vec = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
                        raw = httparse::Request::new(&mut vec);
                        result = raw.parse(&buf[..]);
                    }
                    match result? {
                        httparse::Status::Complete(bytes) => {
                            self.check_head_size(bytes)?;
                            let body = request_body(raw.headers)?;
                            let head = Head::Request {
                                method: raw.method.unwrap(),
                                target: raw.path.unwrap(),
                                version: version_of(raw.version.unwrap()),
                            };
                            let keep_going = self.fire_head_events(
                                &head, raw.headers, events);
                            (body, bytes, keep_going)
                        }
                        httparse::Status::Partial => {
                            self.check_partial(buf)?;
                            return Ok(None);
                        }
                    }
                }
                Mode::Response => {
                    let mut raw =
                        httparse::Response::new(&mut stack_headers);
                    let mut result = raw.parse(&buf[..]);
                    if matches!(result,
                        Err(httparse::Error::TooManyHeaders))
                    {
                        vec = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
                        raw = httparse::Response::new(&mut vec);
                        result = raw.parse(&buf[..]);
                    }
                    match result? {
                        httparse::Status::Complete(bytes) => {
                            self.check_head_size(bytes)?;
                            let code = raw.code.unwrap();
                            let body = response_body(
                                self.head_request, code, raw.headers)?;
                            let head = Head::Response {
                                version: version_of(raw.version.unwrap()),
                                code: code,
                                reason: raw.reason.unwrap_or(""),
                            };
                            let keep_going = self.fire_head_events(
                                &head, raw.headers, events);
                            (body, bytes, keep_going)
                        }
                        httparse::Status::Partial => {
                            self.check_partial(buf)?;
                            return Ok(None);
                        }
                    }
                }
            }
        };
        buf.consume(consumed);
        if !keep_going {
            return Ok(Some(State::Terminated));
        }
        Ok(Some(State::Body(body)))
    }

    fn fire_head_events<E: Events>(&self, head: &Head,
        raw_headers: &[httparse::Header], events: &mut E)
        -> bool
    {
        if !events.message_begin(head) {
            return false;
        }
        for header in raw_headers.iter() {
            if !events.header(header.name, header.value) {
                return false;
            }
        }
        events.headers_end()
    }

    fn check_head_size(&self, bytes: usize) -> Result<(), Error> {
        if bytes > self.max_headers_size {
            return Err(Error::HeadersTooLarge);
        }
        Ok(())
    }

    fn check_partial(&self, buf: &Buf) -> Result<(), Error> {
        if !buf[..].contains(&b'\n') {
            if buf.len() > self.max_request_line {
                return Err(Error::RequestLineTooLong);
            }
        } else if buf.len() > self.max_headers_size {
            return Err(Error::HeadersTooLarge);
        }
        Ok(())
    }
}
