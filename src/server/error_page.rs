use std::io::Write;

use netbuf::Buf;


/// Render the default error document
///
/// Kept deliberately tiny; installations that want branded error pages
/// register a custom error handler on the request instead.
pub fn default_body(code: u16, reason: &str) -> Buf {
    let mut buf = Buf::new();
    write!(buf,
        "<html>\
         <head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body>\
         </html>",
        code = code, reason = reason).unwrap();
    buf
}
