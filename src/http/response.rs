use std::fmt::{self, Display, Write};
use std::io;

/// Fills a fixed scratch buffer with HTTP response headers.
///
/// The writer appends a status line and header fields, terminated by the
/// blank line from [`finish`](ResponseHeaders::finish). Running out of
/// buffer is an error, not a truncation; the connection scratch buffer
/// comfortably fits any header block the engine produces.
pub(crate) struct ResponseHeaders<'a> {
    buffer: &'a mut [u8],
    size: usize,
}

impl<'a> ResponseHeaders<'a> {
    /// Starts a response with the given status code and reason phrase.
    pub(crate) fn new(
        buffer: &'a mut [u8],
        status_code: u32,
        reason: &str,
    ) -> io::Result<ResponseHeaders<'a>> {
        let mut headers = ResponseHeaders { buffer, size: 0 };
        headers.print(format_args!("HTTP/1.1 {status_code} {reason}\r\n"))?;
        Ok(headers)
    }

    /// Appends one header field.
    pub(crate) fn field(&mut self, key: &str, value: impl Display) -> io::Result<()> {
        self.print(format_args!("{key}: {value}\r\n"))
    }

    /// Terminates the header block and returns its size in bytes.
    pub(crate) fn finish(mut self) -> io::Result<usize> {
        self.print(format_args!("\r\n"))?;
        Ok(self.size)
    }

    fn print(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.write_fmt(args)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "response header overflow"))
    }
}

impl Write for ResponseHeaders<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = self.size + bytes.len();

        if end > self.buffer.len() {
            return Err(fmt::Error);
        }

        self.buffer[self.size..end].copy_from_slice(bytes);
        self.size = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_status_line_and_fields() {
        let mut buffer = [0u8; 256];

        let mut headers = ResponseHeaders::new(&mut buffer, 200, "Okay").unwrap();
        headers.field("Content-Length", 3_145_728u64).unwrap();
        headers.field("Connection", "keep-alive").unwrap();
        let size = headers.finish().unwrap();

        assert_eq!(
            &buffer[..size],
            b"HTTP/1.1 200 Okay\r\nContent-Length: 3145728\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn overflow_is_an_error() {
        let mut buffer = [0u8; 16];

        let result = ResponseHeaders::new(&mut buffer, 200, "A reason far too long for the room");
        assert!(result.is_err());
    }
}
