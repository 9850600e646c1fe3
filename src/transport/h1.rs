//! HTTP/1.1 over plain TCP, both directions.
//!
//! Uses httparse for message heads and raw I/O for everything else, so the
//! exact header order and repetition a test declares reach the wire
//! unchanged. The client half talks to the cache under test; the server half
//! reads requests for the origin.

use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::response::Response;

/// Maximum message head size (64KB).
pub const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Request-target form (RFC 9112 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `/path?query`, sent to an origin or a reverse proxy.
    Origin(String),
    /// `http://host/path`, sent to a forward proxy.
    Absolute(String),
}

impl RequestTarget {
    fn as_str(&self) -> &str {
        match self {
            Self::Origin(path) | Self::Absolute(path) => path,
        }
    }
}

/// HTTP/1.1 client connection.
pub struct H1Connection<S> {
    stream: S,
    /// Whether the connection should be closed after the current response.
    should_close: bool,
}

impl<S> H1Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            should_close: false,
        }
    }

    /// Check if the connection should be closed (not reusable).
    pub fn should_close(&self) -> bool {
        self.should_close
    }

    /// Send a request and receive the final response.
    pub async fn send_request(
        &mut self,
        method: &Method,
        target: &RequestTarget,
        host: &str,
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<Response> {
        let request_bytes = build_request(method, target, host, headers, body.as_ref())?;
        self.stream
            .write_all(&request_bytes)
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to write request: {}", e)))?;

        if let Some(body) = body {
            self.stream
                .write_all(&body)
                .await
                .map_err(|e| Error::http_protocol(format!("Failed to write body: {}", e)))?;
        }

        self.stream
            .flush()
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to flush: {}", e)))?;

        self.read_response(method).await
    }

    /// Read and parse an HTTP/1.1 response, skipping 1xx interim responses.
    async fn read_response(&mut self, method: &Method) -> Result<Response> {
        let mut buffer = Vec::with_capacity(8192);

        loop {
            fill_head(&mut self.stream, &mut buffer).await?;

            let (response, consumed) = self.parse_response(&buffer, method).await?;
            buffer.drain(..consumed.min(buffer.len()));

            if (100..200).contains(&response.status) {
                continue;
            }
            return Ok(response);
        }
    }

    /// Parse head and body, returning the response and bytes consumed from
    /// `buffer`.
    async fn parse_response(&mut self, buffer: &[u8], request_method: &Method) -> Result<(Response, usize)> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut response = httparse::Response::new(&mut headers);

        let headers_len = match response
            .parse(buffer)
            .map_err(|e| Error::http_protocol(format!("Failed to parse response: {}", e)))?
        {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                return Err(Error::http_protocol("Incomplete response headers"));
            }
        };

        let status = response
            .code
            .ok_or_else(|| Error::http_protocol("Missing status code"))?;
        let version = format!("HTTP/1.{}", response.version.unwrap_or(1));
        let response_headers = collect_headers(response.headers);

        if let Some(conn) = crate::headers::find_header(&response_headers, "connection") {
            if conn.to_ascii_lowercase().contains("close") {
                self.should_close = true;
            }
        }

        // RFC 9112 Section 6.3: HEAD responses, 1xx, 204 and 304 have no body.
        let has_body = !matches!(status, 100..=199 | 204 | 304) && *request_method != Method::HEAD;
        if !has_body {
            return Ok((Response::new(status, response_headers, Bytes::new(), version), headers_len));
        }

        let transfer_encoding = crate::headers::find_header(&response_headers, "transfer-encoding");
        let is_chunked = transfer_encoding
            .and_then(|v| v.split(',').next_back())
            .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        // Transfer-Encoding overrides Content-Length.
        let content_length = match (transfer_encoding, crate::headers::find_header(&response_headers, "content-length")) {
            (None, Some(cl)) => Some(parse_content_length(cl)?),
            _ => None,
        };

        let body_start = &buffer[headers_len..];
        let (body, consumed) = if is_chunked {
            let body = self.read_chunked_body(body_start.to_vec()).await?;
            (body, buffer.len())
        } else if let Some(len) = content_length {
            let body = self.read_fixed_body(body_start, len).await?;
            (body, headers_len + body_start.len().min(len))
        } else {
            self.should_close = true;
            let body = self.read_until_close(body_start).await?;
            (body, buffer.len())
        };

        Ok((Response::new(status, response_headers, body, version), consumed))
    }

    /// Read body until connection close (EOF).
    async fn read_until_close(&mut self, initial: &[u8]) -> Result<Bytes> {
        let mut body = initial.to_vec();
        self.stream
            .read_to_end(&mut body)
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to read body (close-delimited): {}", e)))?;
        Ok(Bytes::from(body))
    }

    /// Read a fixed-length body; an early close is an incomplete message.
    async fn read_fixed_body(&mut self, initial: &[u8], content_length: usize) -> Result<Bytes> {
        read_exact_body(&mut self.stream, initial, content_length).await
    }

    /// Read a chunked body (RFC 9112 Section 7.1), discarding trailers.
    async fn read_chunked_body(&mut self, initial: Vec<u8>) -> Result<Bytes> {
        let mut body = Vec::new();
        let mut buffer = initial;
        let mut read_buf = vec![0u8; 8192];

        loop {
            let (chunk_size, line_end) = loop {
                if let Some(found) = find_chunk_size(&buffer) {
                    break found;
                }
                let n = self.read_more(&mut read_buf, "chunk size").await?;
                buffer.extend_from_slice(&read_buf[..n]);
            };
            buffer.drain(..line_end);

            if chunk_size == 0 {
                self.consume_trailers(&mut buffer).await?;
                break;
            }

            let chunk_end = chunk_size + 2;
            while buffer.len() < chunk_end {
                let n = self.read_more(&mut read_buf, "chunk data").await?;
                buffer.extend_from_slice(&read_buf[..n]);
            }
            body.extend_from_slice(&buffer[..chunk_size]);
            buffer.drain(..chunk_end);
        }

        Ok(Bytes::from(body))
    }

    async fn consume_trailers(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let mut read_buf = vec![0u8; 4096];
        loop {
            if let Some(pos) = find_crlf(buffer) {
                buffer.drain(..pos + 2);
                if pos == 0 {
                    return Ok(());
                }
                continue;
            }
            let n = self
                .stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::http_protocol(format!("Failed to read trailers: {}", e)))?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    async fn read_more(&mut self, read_buf: &mut [u8], what: &str) -> Result<usize> {
        let n = self
            .stream
            .read(read_buf)
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to read {}: {}", what, e)))?;
        if n == 0 {
            return Err(Error::http_protocol(format!("Connection closed while reading {}", what)));
        }
        Ok(n)
    }
}

/// Serialize a request head.
///
/// Declared headers go out in order; `Host` comes first and is always ours,
/// `Connection: close` is added unless declared, since every exchange uses a
/// fresh connection.
pub fn build_request(
    method: &Method,
    target: &RequestTarget,
    host: &str,
    headers: &[(String, String)],
    body: Option<&Bytes>,
) -> Result<Vec<u8>> {
    for (name, value) in headers {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }

    let mut request = Vec::with_capacity(1024);
    request.extend_from_slice(method.as_str().as_bytes());
    request.push(b' ');
    request.extend_from_slice(target.as_str().as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(b"\r\n");

    let mut has_connection_header = false;
    let mut has_content_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        has_connection_header |= name.eq_ignore_ascii_case("connection");
        has_content_length |= name.eq_ignore_ascii_case("content-length");
        request.extend_from_slice(name.as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    if !has_connection_header {
        request.extend_from_slice(b"Connection: close\r\n");
    }
    if let Some(body) = body {
        if !has_content_length {
            request.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }
    request.extend_from_slice(b"\r\n");
    Ok(request)
}

/// A parsed request head, as received by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Whether the client asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        match crate::headers::find_header(&self.headers, "connection") {
            Some(value) => !value.to_ascii_lowercase().contains("close"),
            None => true,
        }
    }

    /// Path component of the target, for origin-form or absolute-form.
    pub fn path(&self) -> &str {
        let target = self.target.as_str();
        let without_scheme = target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"));
        let path = match without_scheme {
            Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
            None => target,
        };
        path.split(['?', '#']).next().unwrap_or("/")
    }
}

/// Read one request from a server-side stream.
///
/// `buffer` carries bytes across calls for keep-alive connections. Returns
/// `Ok(None)` on a clean close between requests. Request bodies are read
/// and dropped.
pub async fn read_request<S>(stream: &mut S, buffer: &mut Vec<u8>) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    if buffer.is_empty() {
        let mut read_buf = vec![0u8; 8192];
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&read_buf[..n]);
    }
    fill_head(stream, buffer).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request
        .parse(buffer)
        .map_err(|e| Error::http_protocol(format!("Failed to parse request: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(Error::http_protocol("Incomplete request headers")),
    };

    let head = RequestHead {
        method: request.method.unwrap_or("GET").to_string(),
        target: request.path.unwrap_or("/").to_string(),
        headers: collect_headers(request.headers),
    };

    let content_length = match crate::headers::find_header(&head.headers, "content-length") {
        Some(cl) => parse_content_length(cl)?,
        None => 0,
    };
    let body_start = buffer[head_len..].to_vec();
    read_exact_body(stream, &body_start, content_length).await?;
    buffer.drain(..(head_len + body_start.len().min(content_length)).min(buffer.len()));

    Ok(Some(head))
}

/// Keep reading until `buffer` holds a complete message head.
async fn fill_head<S>(stream: &mut S, buffer: &mut Vec<u8>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut read_buf = vec![0u8; 8192];
    while find_header_end(buffer).is_none() {
        if buffer.len() >= MAX_HEADERS_SIZE {
            return Err(Error::http_protocol("Message headers too large"));
        }
        let n = stream
            .read(&mut read_buf)
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to read message head: {}", e)))?;
        if n == 0 {
            return Err(Error::http_protocol("Connection closed before message head complete"));
        }
        buffer.extend_from_slice(&read_buf[..n]);
    }
    Ok(())
}

async fn read_exact_body<S>(stream: &mut S, initial: &[u8], content_length: usize) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let initial_len = initial.len().min(content_length);
    let mut body = Vec::with_capacity(content_length);
    body.extend_from_slice(&initial[..initial_len]);

    while body.len() < content_length {
        let remaining = content_length - body.len();
        let mut chunk = vec![0u8; remaining.min(8192)];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to read body: {}", e)))?;
        if n == 0 {
            return Err(Error::http_protocol(format!(
                "Connection closed before receiving full body (got {} of {} bytes)",
                body.len(),
                content_length
            )));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(Bytes::from(body))
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    raw.iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
        .collect()
}

/// Find the end of a message head (\r\n\r\n).
pub(crate) fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a chunk size line, returning (size, end_of_line_position).
fn find_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    let i = find_crlf(buffer)?;
    let line = String::from_utf8_lossy(&buffer[..i]);
    let size_part = line.split(';').next()?;
    let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
    Some((size, i + 2))
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Header names must be tokens (RFC 9110 Section 5.1).
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::http_protocol("Empty header name"));
    }
    if !name.bytes().all(is_tchar) {
        return Err(Error::http_protocol(format!("Invalid character in header name: {:?}", name)));
    }
    Ok(())
}

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// Header values must not contain NUL, CR, or LF.
fn validate_header_value(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(Error::http_protocol(
            "Invalid character in header value (CR/LF/NUL not allowed)",
        ));
    }
    Ok(())
}

/// Content-Length must be a non-negative integer; repeated values must agree.
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parsed = value.split(',').map(|part| {
        part.trim()
            .parse::<usize>()
            .map_err(|_| Error::http_protocol(format!("Invalid Content-Length: {}", value)))
    });
    let first = parsed
        .next()
        .ok_or_else(|| Error::http_protocol("Empty Content-Length"))??;
    for next in parsed {
        if next? != first {
            return Err(Error::http_protocol(format!("Conflicting Content-Length values: {}", value)));
        }
    }
    Ok(first)
}
