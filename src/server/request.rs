use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::from_utf8;
use std::sync::Arc;
use std::time::SystemTime;

use httpdate::HttpDate;
use netbuf::Buf;
use url::form_urlencoded;

use director::Director;
use enums::{Status, Version};
use headers::{self, HeaderList};
use io::{Source, BufferSource, FilterSource, ChainFilter, ChunkedEncoder};
use serializer;
use server::Config;
use server::error_page;


/// Progress of producing the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// The handler has not produced any output yet
    Unhandled,
    /// At least one body source was handed to the connection
    Populating,
    /// `finish()` was called
    Finished,
}

/// Whether a `Connection` header value asks for a close
///
/// The value may be a comma-separated list of options.
fn connection_close(value: Option<&[u8]>) -> bool {
    match value {
        Some(value) => {
            value.split(|&ch| ch == b',').any(headers::is_close)
        }
        None => false,
    }
}

/// Result of a file-system probe, resolved by an external collaborator
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
}

/// Per-request state and the surface handlers use to build a response
///
/// A request is created by its connection when the request head is parsed
/// and destroyed after the response is fully flushed or the connection is
/// aborted; the connection owns it exclusively.
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: HeaderList,
    pub peer_addr: Option<SocketAddr>,
    pub path: String,
    pub query: Option<String>,
    pub document_root: Option<PathBuf>,
    pub fileinfo: Option<FileInfo>,
    pub pathinfo: String,

    config: Arc<Config>,
    allow_keepalive: bool,

    status: u16,
    reason: Option<String>,
    response_headers: HeaderList,
    output_filters: ChainFilter,
    output_state: OutputState,

    head_block: Option<Buf>,
    head_serialized: bool,
    body_sources: VecDeque<Box<Source>>,
    keep_alive: Option<bool>,
    drop_body: bool,
    body_limit: Option<u64>,

    body_callback: Option<Box<FnMut(&mut Request, &[u8], bool)>>,
    abort_handler: Option<Box<FnMut()>>,
    error_handler: Option<Box<Fn(&mut Request)>>,
    pending_forward: Option<Arc<Director>>,

    expecting_continue: bool,
    continue_pending: bool,
    aborted: bool,
}

impl Request {
    pub fn new(config: &Arc<Config>, method: &str, target: &str,
        version: Version, peer_addr: Option<SocketAddr>,
        allow_keepalive: bool)
        -> Request
    {
        let (path, query) = match target.find('?') {
            Some(pos) => (target[..pos].to_string(),
                          Some(target[pos+1..].to_string())),
            None => (target.to_string(), None),
        };
        Request {
            method: method.to_string(),
            target: target.to_string(),
            version: version,
            headers: HeaderList::new(),
            peer_addr: peer_addr,
            path: path,
            query: query,
            document_root: None,
            fileinfo: None,
            pathinfo: String::new(),
            config: config.clone(),
            allow_keepalive: allow_keepalive,
            status: 0,
            reason: None,
            response_headers: HeaderList::new(),
            output_filters: ChainFilter::new(),
            output_state: OutputState::Unhandled,
            head_block: None,
            head_serialized: false,
            body_sources: VecDeque::new(),
            keep_alive: None,
            drop_body: false,
            body_limit: None,
            body_callback: None,
            abort_handler: None,
            error_handler: None,
            pending_forward: None,
            expecting_continue: false,
            continue_pending: false,
            aborted: false,
        }
    }

    /// Value of a request header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Decoded key/value pairs of the query string
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match self.query {
            Some(ref query) => {
                form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Set the response status once; later calls are ignored
    pub fn set_status(&mut self, status: Status) {
        self.set_raw_status(status.code(), status.reason());
    }

    pub fn set_raw_status(&mut self, code: u16, reason: &str) {
        if self.status != 0 {
            error!("status already set to {}, ignoring {}",
                self.status, code);
            return;
        }
        self.status = code;
        self.reason = Some(reason.to_string());
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn has_status(&self) -> bool {
        self.status != 0
    }

    fn reason_str(&self) -> String {
        match self.reason {
            Some(ref reason) if reason.len() > 0 => reason.clone(),
            _ => Status::from_code(self.status)
                .map(|s| s.reason().to_string())
                .unwrap_or_else(|| String::from("Unknown")),
        }
    }

    /// Append a response header
    pub fn push_response_header<V>(&mut self, name: &str, value: V)
        where V: Into<Vec<u8>>
    {
        if !self.response_headers_mutable("push_response_header") {
            return;
        }
        self.response_headers.push(name, value);
    }

    /// Overwrite (or append) a response header
    pub fn overwrite_response_header<V>(&mut self, name: &str, value: V)
        where V: Into<Vec<u8>>
    {
        if !self.response_headers_mutable("overwrite_response_header") {
            return;
        }
        self.response_headers.overwrite(name, value);
    }

    fn response_headers_mutable(&self, op: &str) -> bool {
        if self.output_state == OutputState::Finished {
            error!("{}() called on a finished request", op);
            return false;
        }
        if self.head_serialized {
            error!("{}() called after the response head was sent", op);
            return false;
        }
        true
    }

    pub fn response_headers(&self) -> &HeaderList {
        &self.response_headers
    }

    /// Push an output filter applying to the whole response body
    pub fn push_output_filter(&mut self, filter: ::io::FilterRef) {
        self.output_filters.push(filter);
    }

    /// Enqueue a response body source
    ///
    /// The first call moves the request to the Populating state. Writing
    /// to a finished request is a programming error; it is reported and
    /// ignored.
    pub fn write<S: Source + 'static>(&mut self, source: S) {
        if self.output_state == OutputState::Finished {
            error!("write() called on a finished request");
            return;
        }
        if self.aborted {
            return;
        }
        self.output_state = OutputState::Populating;
        if self.output_filters.is_empty() {
            self.body_sources.push_back(Box::new(source));
        } else {
            let chain = self.output_filters.clone();
            self.body_sources.push_back(
                Box::new(FilterSource::new(chain, Box::new(source))));
        }
    }

    /// Register a consumer for inbound request body chunks
    ///
    /// The consumer gets each chunk in wire order; the flag is true with
    /// the last one (possibly an empty chunk). Installing the consumer
    /// while an `Expect: 100-continue` is pending makes the server emit
    /// the interim `100 Continue` response right away.
    pub fn set_body_callback<F>(&mut self, callback: F)
        where F: FnMut(&mut Request, &[u8], bool) + 'static
    {
        self.body_callback = Some(Box::new(callback));
        if self.expecting_continue {
            self.expecting_continue = false;
            self.continue_pending = true;
        }
    }

    /// The handler learns of a client abort only through this callback
    pub fn set_abort_handler<F>(&mut self, callback: F)
        where F: FnMut() + 'static
    {
        self.abort_handler = Some(Box::new(callback));
    }

    /// Install a custom error document generator
    ///
    /// Invoked at most once, from `finish()` on an unhandled request; if
    /// it produces output the default error body is skipped.
    pub fn set_error_handler<F>(&mut self, callback: F)
        where F: Fn(&mut Request) + 'static
    {
        self.error_handler = Some(Box::new(callback));
    }

    /// Hand the request to a director for forwarding to a backend
    ///
    /// The actual scheduling happens on the owning connection; the handler
    /// returns `Outcome::Pending` after calling this.
    pub fn forward(&mut self, director: &Arc<Director>) {
        self.pending_forward = Some(director.clone());
    }

    /// Finish the response
    ///
    /// Unhandled requests get a status (404 by default) and an error
    /// document; populated responses get their filter chain flushed.
    /// Calling `finish` twice is a programming error and does nothing.
    pub fn finish(&mut self) {
        if self.output_state == OutputState::Finished {
            error!("finish() called twice on the same request");
            return;
        }
        self.abort_handler = None;
        if self.aborted {
            self.output_state = OutputState::Finished;
            return;
        }
        if self.expecting_continue {
            self.expecting_continue = false;
            if self.status == 0 {
                self.set_status(Status::ExpectationFailed);
            }
        }
        if self.output_state == OutputState::Unhandled {
            if self.status == 0 {
                self.set_status(Status::NotFound);
            }
            if let Some(handler) = self.error_handler.take() {
                handler(self);
            }
            if self.output_state == OutputState::Unhandled {
                let forbidden = !self.response_content_allowed();
                if !forbidden && self.status != Status::Ok.code() {
                    let body = error_page::default_body(
                        self.status, &self.reason_str());
                    self.response_headers.overwrite(
                        "Content-Type", &b"text/html"[..]);
                    let length = format!("{}", body.len());
                    self.response_headers.overwrite(
                        "Content-Length", length.into_bytes());
                    self.write(BufferSource::new(body));
                }
            }
        }
        self.ensure_serialized();
        if !self.output_filters.is_empty() {
            let chain = self.output_filters.clone();
            self.body_sources.push_back(
                Box::new(FilterSource::flush(chain)));
        }
        self.output_state = OutputState::Finished;
    }

    /// Whether this response may carry body bytes on the wire
    ///
    /// False for 1xx, 204 and 304 statuses and for HEAD requests.
    pub fn response_content_allowed(&self) -> bool {
        if self.method == "HEAD" {
            return false;
        }
        match Status::from_code(self.status) {
            Some(status) => status.response_has_body(),
            None => !((self.status >= 100 && self.status < 200)
                      || self.status == 204 || self.status == 304),
        }
    }

    /// Serialize the response head if not done yet
    ///
    /// This decides keep-alive, body framing and the synthetic headers;
    /// it runs right before the first response byte is flushed.
    pub fn ensure_serialized(&mut self) {
        if self.head_serialized {
            return;
        }
        if self.expecting_continue {
            // the handler ignored the expectation entirely
            self.status = Status::ExpectationFailed.code();
            self.reason = Some(
                Status::ExpectationFailed.reason().to_string());
            self.expecting_continue = false;
        }
        if self.status == 0 {
            self.status = Status::Ok.code();
            self.reason = None;
        }

        if !self.response_headers.contains("Content-Type") {
            self.response_headers.push("Content-Type", &b"text/plain"[..]);
        }
        if !self.response_headers.contains("Date") {
            let date = format!("{}", HttpDate::from(SystemTime::now()));
            self.response_headers.push("Date", date.into_bytes());
        }
        if let Some(tag) = self.config.get_server_tag() {
            if !self.response_headers.contains("Server") {
                self.response_headers.push("Server", tag.as_bytes());
            }
        }

        let mut keepalive = self.version == Version::Http11
            && self.allow_keepalive
            && !connection_close(self.headers.get("Connection"));
        if connection_close(self.response_headers.get("Connection")) {
            keepalive = false;
        }

        self.drop_body = !self.response_content_allowed();

        let has_length = self.response_headers.contains("Content-Length");
        if has_length && self.response_headers.contains("Transfer-Encoding") {
            // never emit both; an explicit length wins
            warn!("both Content-Length and Transfer-Encoding set, \
                   dropping Transfer-Encoding");
            self.response_headers.remove("Transfer-Encoding");
        }
        if !has_length && !self.drop_body {
            match self.version {
                Version::Http11 => {
                    self.response_headers.push(
                        "Transfer-Encoding", &b"chunked"[..]);
                    self.push_chunked_encoder();
                }
                Version::Http10 => {
                    match self.measured_body_len() {
                        Some(len) => {
                            let value = format!("{}", len);
                            self.response_headers.push(
                                "Content-Length", value.into_bytes());
                        }
                        // close-delimited body
                        None => keepalive = false,
                    }
                }
            }
        }

        self.response_headers.overwrite("Connection",
            if keepalive { &b"keep-alive"[..] } else { &b"close"[..] });
        self.keep_alive = Some(keepalive);

        // a fixed-size body may not run past the declared length; the
        // connection clamps body bytes against this
        self.body_limit = if self.drop_body {
            None
        } else {
            self.response_headers.get("Content-Length")
                .and_then(|v| from_utf8(v).ok())
                .and_then(|s| s.trim().parse().ok())
        };

        let mut buf = Buf::new();
        serializer::status_line(&mut buf, self.version, self.status,
            &self.reason_str());
        if let Err(e) = serializer::header_list(&mut buf, &self.response_headers) {
            error!("dropping malformed response header: {}", e);
        }
        serializer::end_head(&mut buf);
        self.head_block = Some(buf);
        self.head_serialized = true;
    }

    /// Append the chunked encoder to the output chain
    ///
    /// Sources queued before the decision already carry the handler's own
    /// filters, so they are re-wrapped with the encoder alone.
    fn push_chunked_encoder(&mut self) {
        use std::cell::RefCell;
        use std::rc::Rc;
        let encoder: ::io::FilterRef = Rc::new(RefCell::new(ChunkedEncoder));
        self.output_filters.push(encoder.clone());
        let mut tail = ChainFilter::new();
        tail.push(encoder);
        let old: Vec<_> = self.body_sources.drain(..).collect();
        for source in old {
            self.body_sources.push_back(
                Box::new(FilterSource::new(tail.clone(), source)));
        }
    }

    /// Total length of the queued body, if every source can tell
    fn measured_body_len(&self) -> Option<u64> {
        let mut total = 0;
        for source in self.body_sources.iter() {
            match source.total_len() {
                Some(len) => total += len,
                None => return None,
            }
        }
        Some(total)
    }

    /// Deliver an inbound body chunk to the consumer, if any
    ///
    /// The callback is taken out for the duration of the call, so it can
    /// freely use the request it receives.
    pub fn deliver_body(&mut self, data: &[u8], end: bool) {
        match self.body_callback.take() {
            Some(mut callback) => {
                callback(self, data, end);
                if self.body_callback.is_none() {
                    self.body_callback = Some(callback);
                }
            }
            None => {
                if data.len() > 0 {
                    debug!("discarding {} unconsumed request body bytes",
                        data.len());
                }
            }
        }
    }

    /// Called by the connection on client errors and timeouts
    ///
    /// The abort handler fires exactly once; the handler must not touch
    /// the request afterwards.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        if let Some(mut handler) = self.abort_handler.take() {
            handler();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_finished(&self) -> bool {
        self.output_state == OutputState::Finished
    }

    pub fn output_state(&self) -> OutputState {
        self.output_state
    }

    pub fn note_expect_continue(&mut self) {
        self.expecting_continue = true;
    }

    /// Take the pending `100 Continue` emission flag
    pub fn take_continue(&mut self) -> bool {
        let pending = self.continue_pending;
        self.continue_pending = false;
        pending
    }

    pub fn take_forward(&mut self) -> Option<Arc<Director>> {
        self.pending_forward.take()
    }

    pub fn take_head_block(&mut self) -> Option<Buf> {
        self.head_block.take()
    }

    pub fn output_queue(&mut self) -> &mut VecDeque<Box<Source>> {
        &mut self.body_sources
    }

    pub fn has_queued_output(&self) -> bool {
        self.head_block.is_some() || !self.body_sources.is_empty()
    }

    /// The keep-alive decision, known once the head is serialized
    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    /// True when body bytes must not reach the socket (HEAD, 204, ...)
    pub fn drops_body(&self) -> bool {
        self.drop_body
    }

    /// The declared `Content-Length`, once the head is serialized
    ///
    /// None for chunked and close-delimited bodies.
    pub fn body_limit(&self) -> Option<u64> {
        self.body_limit
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use enums::{Status, Version};
    use io::BufferSource;
    use server::Config;
    use super::{OutputState, Request};

    fn request(method: &str, version: Version) -> Request {
        let cfg = Config::new().done();
        Request::new(&cfg, method, "/hello?name=world", version, None, true)
    }

    fn head_str(req: &mut Request) -> String {
        let head = req.take_head_block().expect("head serialized");
        String::from_utf8_lossy(&head[..]).to_string()
    }

    #[test]
    fn query_split() {
        let req = request("GET", Version::Http11);
        assert_eq!(req.path, "/hello");
        assert_eq!(req.query.as_ref().unwrap(), "name=world");
        assert_eq!(req.query_pairs(),
            vec![("name".to_string(), "world".to_string())]);
    }

    #[test]
    fn default_not_found() {
        let mut req = request("GET", Version::Http11);
        req.finish();
        assert!(req.is_finished());
        assert_eq!(req.status(), 404);
        let head = head_str(&mut req);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Content-Length: "));
        assert!(!req.output_queue().is_empty());
    }

    #[test]
    fn double_finish_is_noop() {
        let mut req = request("GET", Version::Http11);
        req.finish();
        let status = req.status();
        let sources = req.output_queue().len();
        req.finish();
        assert_eq!(req.status(), status);
        assert_eq!(req.output_queue().len(), sources);
    }

    #[test]
    fn status_set_once() {
        let mut req = request("GET", Version::Http11);
        req.set_status(Status::Ok);
        req.set_status(Status::NotFound);
        assert_eq!(req.status(), 200);
    }

    #[test]
    fn http10_gets_content_length() {
        let mut req = request("GET", Version::Http10);
        req.set_status(Status::Ok);
        req.write(BufferSource::copy(b"hi"));
        req.finish();
        let head = head_str(&mut req);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(req.keep_alive(), Some(false));
        assert_eq!(req.body_limit(), Some(2));
    }

    #[test]
    fn http11_gets_chunked() {
        let mut req = request("GET", Version::Http11);
        req.set_status(Status::Ok);
        req.write(BufferSource::copy(b"abc"));
        req.finish();
        let head = head_str(&mut req);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(req.keep_alive(), Some(true));
    }

    #[test]
    fn explicit_length_wins_over_chunked() {
        let mut req = request("GET", Version::Http11);
        req.set_status(Status::Ok);
        req.push_response_header("Content-Length", &b"3"[..]);
        req.push_response_header("Transfer-Encoding", &b"chunked"[..]);
        req.write(BufferSource::copy(b"abc"));
        req.finish();
        let head = head_str(&mut req);
        assert!(head.contains("Content-Length: 3\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
    }

    #[test]
    fn head_request_drops_body() {
        let mut req = request("HEAD", Version::Http11);
        req.set_status(Status::Ok);
        req.push_response_header("Content-Length", &b"4"[..]);
        req.write(BufferSource::copy(b"body"));
        req.finish();
        let head = head_str(&mut req);
        assert!(head.contains("Content-Length: 4\r\n"));
        assert!(req.drops_body());
    }

    #[test]
    fn write_after_finish_ignored() {
        let mut req = request("GET", Version::Http11);
        req.finish();
        let sources = req.output_queue().len();
        req.write(BufferSource::copy(b"late"));
        assert_eq!(req.output_queue().len(), sources);
    }

    #[test]
    fn abort_handler_fires_once() {
        use std::cell::Cell;
        use std::rc::Rc;
        let fired = Rc::new(Cell::new(0));
        let mut req = request("GET", Version::Http11);
        let counter = fired.clone();
        req.set_abort_handler(move || counter.set(counter.get() + 1));
        req.abort();
        req.abort();
        assert_eq!(fired.get(), 1);
        assert!(req.is_aborted());
    }

    #[test]
    fn custom_error_handler_overrides_default() {
        let mut req = request("GET", Version::Http11);
        req.set_error_handler(|r: &mut Request| {
            r.overwrite_response_header("Content-Length", &b"5"[..]);
            r.write(BufferSource::copy(b"oops\n"));
        });
        req.finish();
        assert_eq!(req.status(), 404);
        let head = head_str(&mut req);
        assert!(head.contains("Content-Length: 5\r\n"));
        // only the custom body, no default error page appended
        assert_eq!(req.output_queue().len(), 1);
    }

    #[test]
    fn expectation_failed_when_continue_ignored() {
        let mut req = request("POST", Version::Http11);
        req.note_expect_continue();
        req.finish();
        assert_eq!(req.status(), 417);
    }

    #[test]
    fn continue_pending_after_body_callback() {
        let mut req = request("POST", Version::Http11);
        req.note_expect_continue();
        assert!(!req.take_continue());
        req.set_body_callback(|_, _, _| ());
        assert!(req.take_continue());
        assert!(!req.take_continue());
    }
}
