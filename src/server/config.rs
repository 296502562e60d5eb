use std::sync::Arc;
use std::time::Duration;

use server::Config;

impl Config {
    /// Create a config with defaults
    pub fn new() -> Config {
        Config {
            max_request_line: 8192,
            max_headers_size: 65536,
            max_keepalive_requests: 100,
            keep_alive_timeout: Duration::new(75, 0),
            read_timeout: Duration::new(60, 0),
            write_timeout: Duration::new(60, 0),
            output_watermark: 65536,
            server_tag: Some(
                concat!("tk-gateway/", env!("CARGO_PKG_VERSION"))
                .to_string()),
        }
    }
    /// Maximum length of the request line in bytes
    pub fn max_request_line(&mut self, value: usize) -> &mut Self {
        self.max_request_line = value;
        self
    }
    /// Maximum size of the whole request header block in bytes
    pub fn max_headers_size(&mut self, value: usize) -> &mut Self {
        self.max_headers_size = value;
        self
    }
    /// Requests served on one connection before it is closed
    ///
    /// Zero disables keep-alive entirely.
    pub fn max_keepalive_requests(&mut self, value: usize) -> &mut Self {
        self.max_keepalive_requests = value;
        self
    }
    /// How long an idle keep-alive connection is kept around
    pub fn keep_alive_timeout(&mut self, value: Duration) -> &mut Self {
        self.keep_alive_timeout = value;
        self
    }
    /// Timeout expiring when no inbound byte arrives while one is needed
    pub fn read_timeout(&mut self, value: Duration) -> &mut Self {
        self.read_timeout = value;
        self
    }
    /// Timeout expiring when outbound bytes stay unflushed
    pub fn write_timeout(&mut self, value: Duration) -> &mut Self {
        self.write_timeout = value;
        self
    }
    /// Stop pulling body sources when this many bytes are buffered
    pub fn output_watermark(&mut self, value: usize) -> &mut Self {
        self.output_watermark = value;
        self
    }
    /// The `Server` header value, `None` to advertise nothing
    pub fn server_tag<T>(&mut self, value: T) -> &mut Self
        where T: Into<Option<String>>
    {
        self.server_tag = value.into();
        self
    }
    /// Create a Arc'd config clone to pass to the constructor
    ///
    /// This is just a convenience method.
    pub fn done(&mut self) -> Arc<Config> {
        Arc::new(self.clone())
    }

    pub fn get_max_request_line(&self) -> usize {
        self.max_request_line
    }
    pub fn get_max_headers_size(&self) -> usize {
        self.max_headers_size
    }
    pub fn get_max_keepalive_requests(&self) -> usize {
        self.max_keepalive_requests
    }
    pub fn get_keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }
    pub fn get_read_timeout(&self) -> Duration {
        self.read_timeout
    }
    pub fn get_write_timeout(&self) -> Duration {
        self.write_timeout
    }
    pub fn get_output_watermark(&self) -> usize {
        self.output_watermark
    }
    pub fn get_server_tag(&self) -> Option<&str> {
        self.server_tag.as_ref().map(|x| &x[..])
    }
}
