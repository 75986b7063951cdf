//! Minimal HTTP/1.1 plumbing: request heads in, `Connection: close`
//! responses out. Bodies are never buffered here; callers stream them.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted before the connection is refused
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("connection closed before a request arrived")]
    Closed,

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed request line and headers
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    /// Path without the query string, still percent-encoded
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header named `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded value of the first query parameter named `name`
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the query names `name`, with or without a value (`?open`)
    pub fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }

    pub fn content_length(&self) -> Result<Option<u64>, HttpError> {
        match self.header("content-length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| HttpError::Malformed("bad Content-Length")),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Header value contains `token` as one of its comma-separated items
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|v| {
            v.split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// Position just past the blank line ending the head
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    if let Some(i) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(i + 4);
    }
    data.windows(2).position(|w| w == b"\n\n").map(|i| i + 2)
}

/// Read one request head. Returns it with whatever body bytes arrived in
/// the same reads.
pub async fn read_head<R>(reader: &mut R) -> Result<(RequestHead, Bytes), HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = parse_head(&buf[..end])?;
            let rest = buf.split_off(end).freeze();
            return Ok((head, rest));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                HttpError::Closed
            } else {
                HttpError::Malformed("truncated head")
            });
        }
    }
}

pub fn parse_head(raw: &[u8]) -> Result<RequestHead, HttpError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpError::Malformed("head is not UTF-8"))?;
    let mut lines = text.lines();

    let request_line = lines.next().ok_or(HttpError::Malformed("empty head"))?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(HttpError::Malformed("bad request line"));
    };
    if !target.starts_with('/') {
        return Err(HttpError::Malformed("target must be a path"));
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Malformed("header without colon"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        query: url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        headers,
    })
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Response status line plus headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: u16,
    headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Add a header. Control characters are dropped from the value so
    /// request-supplied text cannot split the head.
    pub fn header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        let value = value.as_ref().chars().filter(|c| !c.is_control()).collect();
        self.headers.push((name, value));
        self
    }

    pub fn header_opt(self, name: &'static str, value: Option<impl AsRef<str>>) -> Self {
        match value {
            Some(v) => self.header(name, v),
            None => self,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Serialize, closing the connection after this response unless it is
    /// a protocol switch.
    pub fn encode(&self) -> Bytes {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, status_text(self.status));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if self.status != 101 {
            out.push_str("Connection: close\r\n");
        }
        out.push_str("\r\n");
        Bytes::from(out)
    }
}

/// Complete response with a body
pub fn response(status: u16, content_type: &str, body: &[u8]) -> Bytes {
    let head = ResponseHead::new(status)
        .header("Content-Type", content_type)
        .header("Content-Length", body.len().to_string())
        .encode();
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
    out.freeze()
}

pub fn text_response(status: u16, body: &str) -> Bytes {
    response(status, "text/plain; charset=utf-8", body.as_bytes())
}

pub fn json_response<T: Serialize>(status: u16, value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", &body),
        Err(e) => text_response(500, &e.to_string()),
    }
}
