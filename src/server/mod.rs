//! HTTP server protocol implementation
//!
mod config;
mod error;
mod error_page;
mod request;
mod proto;

pub use self::error::Error;
pub use self::request::{Request, FileInfo, OutputState};
pub use self::proto::{Proto, PureProto};

use std::time::Duration;


/// Fine-grained configuration of the HTTP server
#[derive(Debug, Clone)]
pub struct Config {
    max_request_line: usize,
    max_headers_size: usize,
    max_keepalive_requests: usize,
    keep_alive_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    output_watermark: usize,
    server_tag: Option<String>,
}
