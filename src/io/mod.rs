//! The response body pipeline: pull sources, sinks and output filters
//!
mod source;
mod filter;
mod chunked_encoder;

pub use self::source::{Source, Sink, BufferSource, FileSource, FilterSource};
pub use self::source::pump;
pub use self::filter::{Filter, FilterRef, ChainFilter};
pub use self::chunked_encoder::ChunkedEncoder;
