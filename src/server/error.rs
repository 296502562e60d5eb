use std::io;

use parser;


quick_error! {
    #[derive(Debug)]
    pub enum Error {
        Io(err: io::Error) {
            description("I/O error")
            display("I/O error: {}", err)
            from()
        }
        Parse(err: parser::Error) {
            description("request parse error")
            display("request parse error: {}", err)
            from()
        }
        /// Connection was reset while a request or response was in flight
        ConnectionReset {
            description("connection closed unexpectedly")
        }
        ReadTimeout {
            description("timed out waiting for request bytes")
        }
        WriteTimeout {
            description("timed out writing the response")
        }
        /// An upstream error after response bytes already reached the client
        Upstream(err: ::director::Error) {
            description("upstream error")
            display("upstream error: {}", err)
            from()
        }
    }
}
