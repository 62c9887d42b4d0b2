use std::ops::Range;
use std::os::fd::RawFd;

/// Request methods understood by the engine.
///
/// The set is deliberately small; anything else fails parsing and closes
/// the connection before dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Method {
    Get,
    Put,
    Post,
}

impl Method {
    /// Parses a method token.
    ///
    /// The token is at most four ASCII letters and is matched as one
    /// 32-bit little-endian word against the supported set.
    pub(crate) fn parse(token: &[u8]) -> Option<Method> {
        const GET: u32 = u32::from_le_bytes(*b"GET\0");
        const PUT: u32 = u32::from_le_bytes(*b"PUT\0");
        const POST: u32 = u32::from_le_bytes(*b"POST");

        if token.is_empty() || token.len() > 4 {
            return None;
        }

        let mut word = [0u8; 4];
        word[..token.len()].copy_from_slice(token);

        match u32::from_le_bytes(word) {
            GET => Some(Method::Get),
            PUT => Some(Method::Put),
            POST => Some(Method::Post),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
        }
    }
}

/// Protocol versions understood by the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Version {
    V10,
    V11,
}

impl Version {
    /// Parses the three version bytes after `HTTP/`.
    pub(crate) fn parse(token: &[u8]) -> Option<Version> {
        const V10: u32 = u32::from_le_bytes(*b"1.0\0");
        const V11: u32 = u32::from_le_bytes(*b"1.1\0");

        if token.len() != 3 {
            return None;
        }

        let mut word = [0u8; 4];
        word[..3].copy_from_slice(token);

        match u32::from_le_bytes(word) {
            V10 => Some(Version::V10),
            V11 => Some(Version::V11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::V10 => "1.0",
            Version::V11 => "1.1",
        }
    }
}

/// What happens to the connection after the response.
///
/// Close unless the request carried `Connection: keep-alive`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Disposition {
    Close,
    KeepAlive,
}

/// The parsed request, stored inside the connection.
///
/// Text fields are ranges into the connection's header buffer; the
/// buffer outlives the request, so nothing is copied out of it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ParsedRequest {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) uri: Range<usize>,
    pub(crate) host: Option<Range<usize>>,
    pub(crate) connection: Disposition,
    pub(crate) content_length: u64,
}

/// The request view handed to the dispatch handler.
///
/// Borrows the connection's header buffer; valid only for the duration
/// of the dispatch call, which is also exactly how long the handler is
/// allowed to hold it.
pub struct HttpRequest<'a> {
    fd: RawFd,
    method: Method,
    version: Version,
    uri: &'a str,
    host: Option<&'a str>,
    connection: Disposition,
    content_length: u64,
}

impl<'a> HttpRequest<'a> {
    pub(crate) fn new(fd: RawFd, parsed: &ParsedRequest, buffer: &'a [u8]) -> HttpRequest<'a> {
        // The parser validated both ranges as UTF-8.
        let uri = std::str::from_utf8(&buffer[parsed.uri.clone()]).unwrap_or_default();
        let host = parsed
            .host
            .clone()
            .map(|range| std::str::from_utf8(&buffer[range]).unwrap_or_default());

        HttpRequest {
            fd,
            method: parsed.method,
            version: parsed.version,
            uri,
            host,
            connection: parsed.connection,
            content_length: parsed.content_length,
        }
    }

    /// The client socket this request arrived on.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn uri(&self) -> &'a str {
        self.uri
    }

    /// The `Host` header value, verbatim.
    pub fn host(&self) -> Option<&'a str> {
        self.host
    }

    pub fn connection(&self) -> Disposition {
        self.connection
    }

    /// The declared `Content-Length`, 0 when absent.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }
}
