// src/sniff.rs - incremental HTTP/1.x message extraction
use std::collections::BTreeMap;

use crate::error::SniffError;

const REQUEST_PREFIXES: [&[u8]; 7] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
];
const RESPONSE_PREFIX: &[u8] = b"HTTP/1.";
const HEADER_END: &[u8] = b"\r\n\r\n";

const BINARY_CONTENT_TYPES: [&str; 10] = [
    "image/",
    "video/",
    "audio/",
    "application/pdf",
    "application/zip",
    "application/x-",
    "application/octet-stream",
    "font/",
    "application/vnd.",
    "multipart/form-data",
];

pub const TRUNCATED_MARKER: &str = "[Truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Captured client toward the real server.
    Outgoing,
    Incoming,
}

pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub host: Option<String>,
    pub headers: Headers,
    pub body: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMessage {
    Request(HttpRequest),
    Response(HttpResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffOutcome {
    /// Bytes the caller may drop from the front of its buffer.
    pub consumed: usize,
    pub message: Option<HttpMessage>,
}

impl SniffOutcome {
    fn wait() -> Self {
        Self { consumed: 0, message: None }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.len() > haystack.len() - from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn find_start(buf: &[u8], direction: Direction) -> Option<usize> {
    match direction {
        Direction::Outgoing => REQUEST_PREFIXES.iter().filter_map(|p| find(buf, p, 0)).min(),
        Direction::Incoming => find(buf, RESPONSE_PREFIX, 0),
    }
}

fn longest_prefix(direction: Direction) -> usize {
    match direction {
        Direction::Outgoing => REQUEST_PREFIXES.iter().map(|p| p.len()).max().unwrap_or(0),
        Direction::Incoming => RESPONSE_PREFIX.len(),
    }
}

/// Case-insensitive header lookup.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn is_binary_content_type(content_type: &str) -> bool {
    let ct = content_type.trim().to_ascii_lowercase();
    BINARY_CONTENT_TYPES.iter().any(|prefix| ct.starts_with(prefix))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Headers {
    let mut headers = Headers::new();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        headers
            .entry(key.to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value.trim());
            })
            .or_insert_with(|| value.trim().to_string());
    }
    headers
}

fn render_body(headers: &Headers, body: &[u8], truncated: bool) -> Option<String> {
    if body.is_empty() && !truncated {
        return None;
    }

    let binary = header(headers, "Content-Type").is_some_and(is_binary_content_type);
    let text = if binary {
        format!("[Binary Data: {} bytes]", body.len())
    } else {
        String::from_utf8_lossy(body).into_owned()
    };

    Some(match (truncated, text.is_empty()) {
        (false, _) => text,
        (true, true) => TRUNCATED_MARKER.to_string(),
        (true, false) => format!("{} {}", text, TRUNCATED_MARKER),
    })
}

/// Looks for one complete HTTP/1.x message in `buf`.
///
/// Anything before the first start line is noise and counts toward
/// `consumed`. Until headers and the full `Content-Length` body are present
/// nothing is consumed, unless `flush` is set: then the partial message is
/// accepted, its body tagged as truncated, and the whole buffer consumed.
pub fn sniff(buf: &[u8], direction: Direction, flush: bool) -> Result<SniffOutcome, SniffError> {
    let Some(start) = find_start(buf, direction) else {
        let consumed = if flush {
            buf.len()
        } else {
            // A start line may straddle the next chunk.
            buf.len().saturating_sub(longest_prefix(direction) - 1)
        };
        return Ok(SniffOutcome { consumed, message: None });
    };

    let Some(header_end) = find(buf, HEADER_END, start) else {
        if flush {
            return Ok(SniffOutcome { consumed: buf.len(), message: None });
        }
        return Ok(SniffOutcome::wait());
    };

    let head = String::from_utf8_lossy(&buf[start..header_end]);
    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default();
    let headers = parse_headers(lines);

    let content_length = header(&headers, "Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = header_end + HEADER_END.len();
    let body_end = body_start.saturating_add(content_length);
    let (body, truncated, consumed) = if buf.len() >= body_end {
        (&buf[body_start..body_end], false, body_end)
    } else if flush {
        (&buf[body_start..], true, buf.len())
    } else {
        return Ok(SniffOutcome::wait());
    };

    let body = render_body(&headers, body, truncated);
    let message = match direction {
        Direction::Outgoing => HttpMessage::Request(parse_request(start_line, headers, body, truncated)?),
        Direction::Incoming => HttpMessage::Response(parse_response(start_line, headers, body, truncated)?),
    };

    Ok(SniffOutcome {
        consumed,
        message: Some(message),
    })
}

fn parse_request(
    line: &str,
    headers: Headers,
    body: Option<String>,
    truncated: bool,
) -> Result<HttpRequest, SniffError> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Err(SniffError::StartLine(line.to_string()));
    };
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();
    let host = header(&headers, "Host").map(str::to_string);

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        version,
        host,
        headers,
        body,
        truncated,
    })
}

fn parse_response(
    line: &str,
    headers: Headers,
    body: Option<String>,
    truncated: bool,
) -> Result<HttpResponse, SniffError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let status_code = code
        .parse::<u16>()
        .ok()
        .filter(|c| (100..1000).contains(c))
        .ok_or_else(|| SniffError::StatusCode(code.to_string()))?;

    Ok(HttpResponse {
        version: version.to_string(),
        status_code,
        reason: parts.next().unwrap_or_default().trim().to_string(),
        headers,
        body,
        truncated,
    })
}
