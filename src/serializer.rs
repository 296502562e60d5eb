//! Validated serialization of message heads
//!
//! Unlike a write-through encoder, the server assembles response headers in
//! a `HeaderList` first and serializes the whole head in one block right
//! before the first body byte is flushed. These helpers do the actual
//! byte-level writing and reject header names or values that would corrupt
//! the wire format.

use std::fmt::Display;
use std::io::Write;

use netbuf::Buf;

use enums::Version;
use headers::HeaderList;


quick_error! {
    #[derive(Debug)]
    pub enum HeaderError {
        InvalidHeaderName {
            description("header name contains invalid characters")
        }
        InvalidHeaderValue {
            description("header value contains invalid characters")
        }
    }
}

fn invalid_header(value: &[u8]) -> bool {
    value.iter().any(|&x| x == b'\r' || x == b'\n' || x == b'\0')
}

/// Write a `HTTP/M.N code reason` status line
pub fn status_line(buf: &mut Buf, version: Version, code: u16, reason: &str) {
    write!(buf, "{} {} {}\r\n", version, code, reason).unwrap();
}

/// Write a `METHOD SP target SP HTTP/M.N` request line
pub fn request_line(buf: &mut Buf, method: &str, target: &str,
    version: Version)
{
    write!(buf, "{} {} {}\r\n", method, target, version).unwrap();
}

/// Write a single `name: value` header line
pub fn header(buf: &mut Buf, name: &str, value: &[u8])
    -> Result<(), HeaderError>
{
    if invalid_header(name.as_bytes()) {
        return Err(HeaderError::InvalidHeaderName);
    }
    if invalid_header(value) {
        return Err(HeaderError::InvalidHeaderValue);
    }
    buf.write_all(name.as_bytes()).unwrap();
    buf.write_all(b": ").unwrap();
    buf.write_all(value).unwrap();
    buf.write_all(b"\r\n").unwrap();
    Ok(())
}

/// Same as `header` but formats the value directly into the buffer
///
/// Useful for dates and numeric headers.
pub fn format_header<D: Display>(buf: &mut Buf, name: &str, value: D)
    -> Result<(), HeaderError>
{
    if invalid_header(name.as_bytes()) {
        return Err(HeaderError::InvalidHeaderName);
    }
    let line_start = buf.len();
    buf.write_all(name.as_bytes()).unwrap();
    buf.write_all(b": ").unwrap();
    let value_start = buf.len();
    write!(buf, "{}", value).unwrap();
    if invalid_header(&buf[value_start..]) {
        buf.remove_range(line_start..);
        return Err(HeaderError::InvalidHeaderValue);
    }
    buf.write_all(b"\r\n").unwrap();
    Ok(())
}

/// Write the whole header list in order
pub fn header_list(buf: &mut Buf, headers: &HeaderList)
    -> Result<(), HeaderError>
{
    for &(ref name, ref value) in headers.iter() {
        header(buf, name, value)?;
    }
    Ok(())
}

/// Terminate the head block
pub fn end_head(buf: &mut Buf) {
    buf.write_all(b"\r\n").unwrap();
}

#[cfg(test)]
mod test {
    use netbuf::Buf;
    use enums::Version;
    use headers::HeaderList;
    use super::{status_line, request_line, header, format_header,
                header_list, end_head};

    fn as_str(buf: &Buf) -> String {
        String::from_utf8_lossy(&buf[..]).to_string()
    }

    #[test]
    fn minimal_response() {
        let mut buf = Buf::new();
        status_line(&mut buf, Version::Http10, 200, "OK");
        format_header(&mut buf, "Content-Length", 0).unwrap();
        end_head(&mut buf);
        assert_eq!(as_str(&buf),
            "HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
    }

    #[test]
    fn minimal_request() {
        let mut buf = Buf::new();
        request_line(&mut buf, "GET", "/", Version::Http11);
        header(&mut buf, "Host", b"example.com").unwrap();
        end_head(&mut buf);
        assert_eq!(as_str(&buf),
            "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[test]
    fn list_in_order() {
        let mut headers = HeaderList::new();
        headers.push("B", &b"2"[..]);
        headers.push("A", &b"1"[..]);
        let mut buf = Buf::new();
        status_line(&mut buf, Version::Http11, 204, "No Content");
        header_list(&mut buf, &headers).unwrap();
        end_head(&mut buf);
        assert_eq!(as_str(&buf),
            "HTTP/1.1 204 No Content\r\nB: 2\r\nA: 1\r\n\r\n");
    }

    #[test]
    fn crlf_rejected() {
        let mut buf = Buf::new();
        header(&mut buf, "X-Bad", b"a\r\nInjected: 1").unwrap_err();
        header(&mut buf, "X-B\nad", b"1").unwrap_err();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn formatted_value_rejected_and_rolled_back() {
        let mut buf = Buf::new();
        header(&mut buf, "X-Ok", b"fine").unwrap();
        let len = buf.len();
        format_header(&mut buf, "X-Bad", "a\nb").unwrap_err();
        assert_eq!(buf.len(), len);
    }
}
