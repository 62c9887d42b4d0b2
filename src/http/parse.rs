use crate::http::request::{Disposition, Method, ParsedRequest, Version};

use std::ops::Range;

/// Reasons a header block fails to parse.
///
/// All of them close the connection; the engine never answers a request
/// it could not parse.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed header")]
    Malformed,

    #[error("unsupported request method")]
    UnsupportedMethod,

    #[error("unsupported HTTP version")]
    UnsupportedVersion,
}

/// Locates the CRLF-CRLF end-of-header marker.
///
/// Scans `buffer[from..]` and returns the index just past the marker.
/// Callers resuming after a partial read pass `from` backed up four
/// bytes into the previously scanned region, so a marker split across
/// two reads is still found.
pub(crate) fn find_header_end(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }

    (from..=buffer.len() - 4)
        .find(|&i| &buffer[i..i + 4] == b"\r\n\r\n")
        .map(|i| i + 4)
}

/// Parses a request line and headers in place.
///
/// `buffer` holds the complete header block including the blank line.
/// Header keys are folded to lowercase inside the buffer; the returned
/// ranges point back into it. The URI and host values are validated as
/// UTF-8 here so the dispatch view can borrow them as `&str`.
pub(crate) fn parse_request(buffer: &mut [u8]) -> Result<ParsedRequest, ParseError> {
    let end = buffer.len();
    let mut head = 0;

    // Method token, up to the first space.
    let method_token = take_until(buffer, &mut head, b' ')?;
    if method_token.len() > 4 {
        return Err(ParseError::Malformed);
    }

    // Request URI, up to the second space.
    let uri = take_until(buffer, &mut head, b' ')?;

    // Protocol literal, up to the slash.
    let proto = take_until(buffer, &mut head, b'/')?;
    if proto.len() != 4 || &buffer[proto.clone()] != b"HTTP" {
        return Err(ParseError::Malformed);
    }

    // Version, up to the end of the request line.
    let version_token = take_until(buffer, &mut head, b'\r')?;
    expect(buffer, &mut head, b'\n')?;
    if version_token.len() != 3 {
        return Err(ParseError::UnsupportedVersion);
    }

    let mut host = None;
    let mut connection = Disposition::Close;
    let mut content_length = 0u64;

    loop {
        if head >= end {
            return Err(ParseError::Malformed);
        }

        // Blank line terminates the header block.
        if buffer[head] == b'\r' {
            head += 1;
            expect(buffer, &mut head, b'\n')?;
            break;
        }

        let key_start = head;
        while head < end && buffer[head] != b':' {
            buffer[head] = buffer[head].to_ascii_lowercase();
            head += 1;
        }
        if head == end {
            return Err(ParseError::Malformed);
        }
        let key = key_start..head;
        head += 1;

        while head < end && buffer[head] == b' ' {
            head += 1;
        }

        let value = take_until(buffer, &mut head, b'\r')?;
        expect(buffer, &mut head, b'\n')?;

        match &buffer[key] {
            b"host" => host = Some(value),
            b"connection" => {
                if &buffer[value] == b"keep-alive" {
                    connection = Disposition::KeepAlive;
                }
            }
            b"content-length" => {
                content_length = parse_decimal(&buffer[value])?;
            }
            _ => {
                // Unrecognized header fields are ignored.
            }
        }
    }

    let version =
        Version::parse(&buffer[version_token]).ok_or(ParseError::UnsupportedVersion)?;
    let method = Method::parse(&buffer[method_token]).ok_or(ParseError::UnsupportedMethod)?;

    if std::str::from_utf8(&buffer[uri.clone()]).is_err() {
        return Err(ParseError::Malformed);
    }
    if let Some(range) = &host {
        if std::str::from_utf8(&buffer[range.clone()]).is_err() {
            return Err(ParseError::Malformed);
        }
    }

    Ok(ParsedRequest {
        method,
        version,
        uri,
        host,
        connection,
        content_length,
    })
}

/// Advances `head` past the next `delimiter`, returning the range of
/// bytes before it.
fn take_until(
    buffer: &[u8],
    head: &mut usize,
    delimiter: u8,
) -> Result<Range<usize>, ParseError> {
    let start = *head;
    let mut at = *head;

    while at < buffer.len() && buffer[at] != delimiter {
        at += 1;
    }
    if at == buffer.len() {
        return Err(ParseError::Malformed);
    }

    *head = at + 1;
    Ok(start..at)
}

fn expect(buffer: &[u8], head: &mut usize, byte: u8) -> Result<(), ParseError> {
    if *head >= buffer.len() || buffer[*head] != byte {
        return Err(ParseError::Malformed);
    }

    *head += 1;
    Ok(())
}

/// Parses an unsigned base-10 header value.
fn parse_decimal(value: &[u8]) -> Result<u64, ParseError> {
    if value.is_empty() {
        return Err(ParseError::Malformed);
    }

    let mut result = 0u64;
    for &byte in value {
        if !byte.is_ascii_digit() {
            return Err(ParseError::Malformed);
        }
        result = result
            .checked_mul(10)
            .and_then(|r| r.checked_add((byte - b'0') as u64))
            .ok_or(ParseError::Malformed)?;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(
        method: Method,
        version: Version,
        host: &str,
        connection: Option<&str>,
        content_length: Option<u64>,
    ) -> Vec<u8> {
        let mut out = format!("{} /index HTTP/{}\r\n", method.as_str(), version.as_str());
        out.push_str(&format!("Host: {host}\r\n"));
        if let Some(connection) = connection {
            out.push_str(&format!("Connection: {connection}\r\n"));
        }
        if let Some(length) = content_length {
            out.push_str(&format!("Content-Length: {length}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    fn parse(bytes: &[u8]) -> Result<ParsedRequest, ParseError> {
        let mut buffer = bytes.to_vec();
        parse_request(&mut buffer)
    }

    #[test]
    fn round_trips_every_method_and_version() {
        for method in [Method::Get, Method::Put, Method::Post] {
            for version in [Version::V10, Version::V11] {
                for connection in [None, Some("keep-alive"), Some("close")] {
                    for content_length in [None, Some(0), Some(17)] {
                        let bytes =
                            serialize(method, version, "example.org", connection, content_length);
                        let mut buffer = bytes.clone();
                        let parsed = parse_request(&mut buffer).unwrap();

                        assert_eq!(parsed.method, method);
                        assert_eq!(parsed.version, version);
                        assert_eq!(&buffer[parsed.uri.clone()], b"/index");
                        assert_eq!(
                            &buffer[parsed.host.clone().unwrap()],
                            b"example.org"
                        );
                        assert_eq!(
                            parsed.connection,
                            if connection == Some("keep-alive") {
                                Disposition::KeepAlive
                            } else {
                                Disposition::Close
                            }
                        );
                        assert_eq!(parsed.content_length, content_length.unwrap_or(0));
                    }
                }
            }
        }
    }

    #[test]
    fn parses_post_with_explicit_zero_length() {
        let parsed = parse(b"POST /x HTTP/1.0\r\nHost: y\r\nContent-Length: 0\r\n\r\n").unwrap();

        assert_eq!(parsed.method, Method::Post);
        assert_eq!(parsed.version, Version::V10);
        assert_eq!(parsed.content_length, 0);
    }

    #[test]
    fn header_keys_fold_to_lowercase_in_place() {
        let bytes = b"GET / HTTP/1.1\r\nHoSt: x\r\nCONNECTION: keep-alive\r\n\r\n".to_vec();
        let mut buffer = bytes;
        let parsed = parse_request(&mut buffer).unwrap();

        assert_eq!(&buffer[parsed.host.unwrap()], b"x");
        assert_eq!(parsed.connection, Disposition::KeepAlive);
    }

    #[test]
    fn value_case_is_preserved() {
        // Only keys fold; "Keep-Alive" is not the recognized value.
        let parsed = parse(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert_eq!(parsed.connection, Disposition::Close);
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let parsed =
            parse(b"GET / HTTP/1.1\r\nHost: x\r\nX-Whatever: 42\r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(parsed.content_length, 0);
    }

    #[test]
    fn rejects_unknown_method() {
        assert_eq!(
            parse(b"HEAD / HTTP/1.1\r\n\r\n"),
            Err(ParseError::UnsupportedMethod)
        );
    }

    #[test]
    fn rejects_overlong_method_token() {
        assert_eq!(
            parse(b"GARBAGE / HTTP/1.1\r\n\r\n"),
            Err(ParseError::Malformed)
        );
    }

    #[test]
    fn rejects_unknown_version() {
        assert_eq!(
            parse(b"GET / HTTP/2.0\r\n\r\n"),
            Err(ParseError::UnsupportedVersion)
        );
        assert_eq!(
            parse(b"GET / HTTP/1.12\r\n\r\n"),
            Err(ParseError::UnsupportedVersion)
        );
    }

    #[test]
    fn rejects_wrong_protocol_literal() {
        assert_eq!(
            parse(b"GET / HTPP/1.1\r\n\r\n"),
            Err(ParseError::Malformed)
        );
    }

    #[test]
    fn rejects_bare_lf_line_endings() {
        assert_eq!(parse(b"GET / HTTP/1.1\n\n"), Err(ParseError::Malformed));
    }

    #[test]
    fn rejects_non_numeric_content_length() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"),
            Err(ParseError::Malformed)
        );
    }

    #[test]
    fn finds_marker_in_one_piece() {
        let buffer = b"GET / HTTP/1.1\r\n\r\nrest";
        assert_eq!(find_header_end(buffer, 0), Some(18));
    }

    #[test]
    fn finds_marker_split_across_reads() {
        // First read ends with CRLF, second begins with CRLF.
        let mut buffer = b"GET / HTTP/1.1\r\n".to_vec();
        let first_fill = buffer.len();
        assert_eq!(find_header_end(&buffer, 0), None);

        buffer.extend_from_slice(b"\r\n");
        let resume = first_fill.saturating_sub(4);
        assert_eq!(find_header_end(&buffer, resume), Some(18));
    }

    #[test]
    fn marker_split_at_every_offset() {
        let complete = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        for split in 1..complete.len() {
            let first = &complete[..split];
            assert_eq!(find_header_end(first, 0), None, "split at {split}");

            let resume = first.len().saturating_sub(4);
            assert_eq!(
                find_header_end(complete, resume),
                Some(complete.len()),
                "split at {split}"
            );
        }
    }

    #[test]
    fn no_marker_in_garbage() {
        assert_eq!(find_header_end(b"GARBAGEGARBAGEGARBAGE", 0), None);
        assert_eq!(find_header_end(b"\r\n\r", 0), None);
    }
}
