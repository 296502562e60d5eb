use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use netbuf::Buf;


/// A transforming stage of the response body stream
///
/// Filters are pure byte transformers; they never perform I/O. The `eof`
/// flag is passed exactly once, with the last input (possibly empty), and
/// lets a filter emit trailing output.
pub trait Filter {
    fn process(&mut self, input: &[u8], eof: bool) -> Buf;
}

/// Shared handle to a filter
///
/// The same filter instance applies to a whole response stream and may be
/// registered with several in-flight responses, hence the shared handle.
/// Filters run on the connection's worker thread only, so no locking is
/// involved.
pub type FilterRef = Rc<RefCell<Filter>>;

/// An ordered filter chain, applied left to right
#[derive(Clone)]
pub struct ChainFilter {
    filters: Vec<FilterRef>,
}

impl ChainFilter {
    pub fn new() -> ChainFilter {
        ChainFilter {
            filters: Vec::new(),
        }
    }

    pub fn push(&mut self, filter: FilterRef) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the input through every filter in order
    ///
    /// Each stage receives the previous stage's output. An empty chain
    /// copies the input through unchanged.
    pub fn process(&self, input: &[u8], eof: bool) -> Buf {
        let mut iter = self.filters.iter();
        let mut result = match iter.next() {
            Some(first) => first.borrow_mut().process(input, eof),
            None => {
                let mut buf = Buf::new();
                buf.write_all(input).unwrap();
                return buf;
            }
        };
        for filter in iter {
            let next = filter.borrow_mut().process(&result[..], eof);
            result = next;
        }
        result
    }
}

#[cfg(test)]
mod test {
    #[allow(unused_imports)]
    use std::ascii::AsciiExt;
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    use netbuf::Buf;
    use super::{Filter, ChainFilter};

    struct Upper;

    impl Filter for Upper {
        fn process(&mut self, input: &[u8], _eof: bool) -> Buf {
            let mut out = Buf::new();
            for &ch in input {
                out.write_all(&[ch.to_ascii_uppercase()]).unwrap();
            }
            out
        }
    }

    struct Suffix(&'static [u8]);

    impl Filter for Suffix {
        fn process(&mut self, input: &[u8], eof: bool) -> Buf {
            let mut out = Buf::new();
            out.write_all(input).unwrap();
            if eof {
                out.write_all(self.0).unwrap();
            }
            out
        }
    }

    #[test]
    fn empty_chain_copies() {
        let chain = ChainFilter::new();
        let out = chain.process(b"hello", false);
        assert_eq!(&out[..], b"hello");
    }

    #[test]
    fn left_to_right() {
        let mut chain = ChainFilter::new();
        chain.push(Rc::new(RefCell::new(Upper)));
        chain.push(Rc::new(RefCell::new(Suffix(b"!"))));
        let out = chain.process(b"hi", false);
        assert_eq!(&out[..], b"HI");
        let out = chain.process(b"", true);
        assert_eq!(&out[..], b"!");
    }

    #[test]
    fn shared_handle() {
        let upper = Rc::new(RefCell::new(Upper));
        let mut one = ChainFilter::new();
        one.push(upper.clone());
        let mut two = ChainFilter::new();
        two.push(upper);
        assert_eq!(&one.process(b"a", false)[..], b"A");
        assert_eq!(&two.process(b"b", false)[..], b"B");
    }
}
