//! Hand-built HTTP/1.1 requests and `httparse`-backed response parsing
//! over an injected byte stream. One request per connection
//! (`Connection: close`), so bodies without a `Content-Length` are read to
//! end-of-stream. Both paths enforce a hard receive budget; a body that
//! does not fit is an error, never a silent truncation.

use crate::error::{FatalCause, SyncError, SyncResult};
use std::io::{Read, Write};

pub const MAX_HEAD: usize = 8 * 1024;
pub const MAX_BODY: usize = 256 * 1024;

const MAX_HEADERS: usize = 32;

pub struct Request<'a> {
    pub method: &'a str,
    /// Path plus query string.
    pub path: &'a str,
    pub headers: Vec<(&'a str, String)>,
    pub body: &'a [u8],
}

/// Serializes the request head and body onto the stream.
pub fn write_request<W: Write>(stream: &mut W, host: &str, request: &Request<'_>) -> SyncResult<()> {
    let mut head = String::with_capacity(256);

    head.push_str(request.method);
    head.push(' ');
    head.push_str(request.path);
    head.push_str(" HTTP/1.1\r\n");
    head.push_str("Host: ");
    head.push_str(host);
    head.push_str("\r\nConnection: close\r\n");

    for (name, value) in &request.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    head.push_str("Content-Length: ");
    head.push_str(&request.body.len().to_string());
    head.push_str("\r\n\r\n");

    stream.write_all(head.as_bytes())?;
    stream.write_all(request.body)?;
    stream.flush()?;

    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Reads and parses one response. Network failures map onto the retryable
/// arm; anything unparseable or over budget is fatal.
pub fn read_response<R: Read>(stream: &mut R) -> SyncResult<Response> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    // Accumulate until the head parses completely
    let (status, headers, head_len) = loop {
        let received = stream.read(&mut chunk)?;

        if received == 0 {
            return Err(SyncError::Fatal(FatalCause::Malformed));
        }

        buf.extend_from_slice(&chunk[..received]);

        if buf.len() > MAX_HEAD + MAX_BODY {
            return Err(SyncError::Fatal(FatalCause::OversizedBody));
        }

        let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut header_slots);

        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = parsed
                    .code
                    .ok_or(SyncError::Fatal(FatalCause::Malformed))?;

                let headers: Vec<(String, String)> = parsed
                    .headers
                    .iter()
                    .map(|header| {
                        (
                            header.name.to_string(),
                            String::from_utf8_lossy(header.value).into_owned(),
                        )
                    })
                    .collect();

                break (status, headers, head_len);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD {
                    return Err(SyncError::Fatal(FatalCause::Malformed));
                }
            }
            Err(_) => return Err(SyncError::Fatal(FatalCause::Malformed)),
        }
    };

    let mut body = buf.split_off(head_len);
    drop(buf);

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());

    match content_length {
        Some(length) => {
            if length > MAX_BODY {
                return Err(SyncError::Fatal(FatalCause::OversizedBody));
            }

            while body.len() < length {
                let received = stream.read(&mut chunk)?;

                if received == 0 {
                    return Err(SyncError::Fatal(FatalCause::Malformed));
                }

                body.extend_from_slice(&chunk[..received]);
            }

            body.truncate(length);
        }
        None => {
            // Connection-close delimited body
            loop {
                let received = stream.read(&mut chunk)?;

                if received == 0 {
                    break;
                }

                body.extend_from_slice(&chunk[..received]);

                if body.len() > MAX_BODY {
                    return Err(SyncError::Fatal(FatalCause::OversizedBody));
                }
            }
        }
    }

    Ok(Response {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    #[test]
    fn test_request_wire_format() {
        let mut wire = Vec::new();

        write_request(
            &mut wire,
            "edge.example.com",
            &Request {
                method: "POST",
                path: "/api/iot/v1/telemetry/batch",
                headers: vec![
                    ("Authorization", "Bearer abc123".to_string()),
                    ("X-Batch-Id", "42".to_string()),
                ],
                body: b"payload",
            },
        )
        .unwrap();

        let text = String::from_utf8_lossy(&wire);

        assert!(text.starts_with("POST /api/iot/v1/telemetry/batch HTTP/1.1\r\n"));
        assert!(text.contains("Host: edge.example.com\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Authorization: Bearer abc123\r\n"));
        assert!(text.contains("X-Batch-Id: 42\r\n"));
        assert!(text.contains("Content-Length: 7\r\n\r\npayload"));
    }

    #[test]
    fn test_parse_response_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 14\r\n\r\n{\"token\":\"xy\"}";

        let response = read_response(&mut Cursor::new(&raw[..])).unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.body, b"{\"token\":\"xy\"}");
    }

    #[test]
    fn test_parse_response_without_content_length_reads_to_close() {
        let raw = b"HTTP/1.1 503 Service Unavailable\r\n\r\nbusy";

        let response = read_response(&mut Cursor::new(&raw[..])).unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.body, b"busy");
    }

    /// Reader that trickles one byte per call, the worst fragmentation a
    /// stream can offer.
    struct Trickle<'a> {
        data: &'a [u8],
        offset: usize,
    }

    impl<'a> io::Read for Trickle<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.offset == self.data.len() || buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.data[self.offset];
            self.offset += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_parse_fragmented_response() {
        let raw = b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";

        let response = read_response(&mut Trickle {
            data: raw,
            offset: 0,
        })
        .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"ok");
    }

    #[test]
    fn test_oversized_declared_body_is_fatal() {
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY + 1
        );

        let result = read_response(&mut Cursor::new(raw.as_bytes()));

        assert_eq!(result, Err(SyncError::Fatal(FatalCause::OversizedBody)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let raw = b"SPDY/9000 nonsense\r\n\r\n";

        let result = read_response(&mut Cursor::new(&raw[..]));

        assert_eq!(result, Err(SyncError::Fatal(FatalCause::Malformed)));
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";

        let result = read_response(&mut Cursor::new(&raw[..]));

        assert_eq!(result, Err(SyncError::Fatal(FatalCause::Malformed)));
    }
}
