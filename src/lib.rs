//! HTTP/1.x server and reverse-proxy load balancer based on `tokio` tools
#![recursion_limit="100"]

extern crate futures;
extern crate url;
extern crate httparse;
extern crate httpdate;
extern crate tokio_core;
extern crate tokio_io;
extern crate netbuf;
extern crate tk_bufstream;
#[macro_use(quick_error)] extern crate quick_error;
#[macro_use] extern crate matches;
#[macro_use] extern crate log;


pub mod io;
pub mod server;
pub mod director;
pub mod runtime;
mod enums;
mod headers;
mod chunked;
mod body_parser;
mod parser;
mod serializer;
mod worker;
mod listener;

pub use enums::{Version, Status};
pub use headers::HeaderList;
pub use parser::{Parser, Events, Head};
pub use parser::Error as ParseError;
pub use worker::{Worker, WorkerRef};
pub use listener::Listener;
