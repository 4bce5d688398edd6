//! Byte-level helpers for raw HTTP/1 payloads.
//!
//! Captured traffic is never parsed into a structured request: filters and
//! rewrites work directly on the bytes so that whatever the client sent is
//! replayed unchanged apart from the edited region. Accessors borrow from the
//! payload; mutating helpers return a fresh buffer.

const CRLF: &[u8] = b"\r\n";
const EMPTY_LINE: &[u8] = b"\r\n\r\n";

const REQUEST_PREFIXES: [&[u8]; 10] = [
    b"GET ", b"OPTI", b"HEAD", b"POST", b"PUT ", b"DELE", b"TRAC", b"CONN", b"PATC", b"PURG",
];

/// Location of one header line inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSpan {
    /// First byte of the header name.
    pub start: usize,
    pub value_start: usize,
    pub value_end: usize,
    /// First byte after the line's CRLF.
    pub end: usize,
}

/// Offset of the first body byte, i.e. just past `\r\n\r\n`.
pub fn headers_end(payload: &[u8]) -> Option<usize> {
    find(payload, EMPTY_LINE).map(|idx| idx + EMPTY_LINE.len())
}

pub fn has_full_headers(payload: &[u8]) -> bool {
    headers_end(payload).is_some()
}

pub fn body(payload: &[u8]) -> &[u8] {
    match headers_end(payload) {
        Some(idx) => &payload[idx..],
        None => &[],
    }
}

/// Request method, or the protocol token for responses.
pub fn method(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == b' ') {
        Some(end) => &payload[..end],
        None => &[],
    }
}

fn start_line(payload: &[u8]) -> &[u8] {
    match find(payload, CRLF) {
        Some(end) => &payload[..end],
        None => payload,
    }
}

fn path_span(payload: &[u8]) -> Option<(usize, usize)> {
    let line = start_line(payload);
    let start = line.iter().position(|&b| b == b' ')? + 1;
    let len = line[start..]
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(line.len() - start);
    Some((start, start + len))
}

pub fn path(payload: &[u8]) -> &[u8] {
    match path_span(payload) {
        Some((start, end)) => &payload[start..end],
        None => &[],
    }
}

pub fn set_path(payload: &[u8], new_path: &[u8]) -> Vec<u8> {
    match path_span(payload) {
        Some((start, end)) => splice(payload, start, end, new_path),
        None => payload.to_vec(),
    }
}

/// Three digit status code of a response payload.
pub fn status(payload: &[u8]) -> Option<&[u8]> {
    if !payload.starts_with(b"HTTP/") {
        return None;
    }
    let line = start_line(payload);
    let start = line.iter().position(|&b| b == b' ')? + 1;
    let code = line.get(start..start + 3)?;
    code.iter().all(u8::is_ascii_digit).then_some(code)
}

pub fn is_request_payload(payload: &[u8]) -> bool {
    payload.len() >= 4 && REQUEST_PREFIXES.iter().any(|p| payload.starts_with(p))
}

pub fn is_http_payload(payload: &[u8]) -> bool {
    is_request_payload(payload) || payload.starts_with(b"HTTP/")
}

/// Finds header `name` (ASCII case-insensitive) in the header block.
pub fn find_header(payload: &[u8], name: &[u8]) -> Option<HeaderSpan> {
    let limit = headers_end(payload).unwrap_or(payload.len());
    let mut line_start = find(payload, CRLF)? + CRLF.len();
    while line_start < limit {
        let rest = &payload[line_start..limit];
        let line_len = find(rest, CRLF).unwrap_or(rest.len());
        if line_len == 0 {
            return None;
        }
        let line = &rest[..line_len];
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(name) {
                let mut value_start = colon + 1;
                while value_start < line_len && matches!(line[value_start], b' ' | b'\t') {
                    value_start += 1;
                }
                let mut value_end = line_len;
                while value_end > value_start && matches!(line[value_end - 1], b' ' | b'\t') {
                    value_end -= 1;
                }
                let end = (line_start + line_len + CRLF.len()).min(payload.len());
                return Some(HeaderSpan {
                    start: line_start,
                    value_start: line_start + value_start,
                    value_end: line_start + value_end,
                    end,
                });
            }
        }
        line_start += line_len + CRLF.len();
    }
    None
}

pub fn header<'a>(payload: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    find_header(payload, name).map(|span| &payload[span.value_start..span.value_end])
}

/// Replaces the value of `name`, adding the header when it is missing.
pub fn set_header(payload: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    match find_header(payload, name) {
        Some(span) => splice(payload, span.value_start, span.value_end, value),
        None => add_header(payload, name, value),
    }
}

/// Inserts a header line right after the start line.
pub fn add_header(payload: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    let Some(line_end) = find(payload, CRLF) else {
        return payload.to_vec();
    };
    let at = line_end + CRLF.len();
    let mut line = Vec::with_capacity(name.len() + value.len() + 4);
    line.extend_from_slice(name);
    line.extend_from_slice(b": ");
    line.extend_from_slice(value);
    line.extend_from_slice(CRLF);
    splice(payload, at, at, &line)
}

pub fn delete_header(payload: &[u8], name: &[u8]) -> Vec<u8> {
    match find_header(payload, name) {
        Some(span) => splice(payload, span.start, span.end, &[]),
        None => payload.to_vec(),
    }
}

pub fn content_length(payload: &[u8]) -> Option<usize> {
    let raw = header(payload, b"Content-Length")?;
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

pub fn is_chunked(payload: &[u8]) -> bool {
    header(payload, b"Transfer-Encoding")
        .map(|v| contains_ignore_case(v, b"chunked"))
        .unwrap_or(false)
}

fn query_span(payload: &[u8]) -> Option<(usize, usize)> {
    let (start, end) = path_span(payload)?;
    let q = payload[start..end].iter().position(|&b| b == b'?')?;
    Some((start + q + 1, end))
}

/// Value of query parameter `name` together with its byte range.
fn param_span(payload: &[u8], name: &[u8]) -> Option<(usize, usize)> {
    let (qs, qe) = query_span(payload)?;
    let mut pos = qs;
    while pos <= qe {
        let pair_end = payload[pos..qe]
            .iter()
            .position(|&b| b == b'&')
            .map(|i| pos + i)
            .unwrap_or(qe);
        let pair = &payload[pos..pair_end];
        let (key, value_start) = match pair.iter().position(|&b| b == b'=') {
            Some(eq) => (&pair[..eq], pos + eq + 1),
            None => (pair, pair_end),
        };
        if key == name {
            return Some((value_start, pair_end));
        }
        pos = pair_end + 1;
    }
    None
}

pub fn path_param<'a>(payload: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    param_span(payload, name).map(|(s, e)| &payload[s..e])
}

/// Sets query parameter `name`, appending it when absent.
pub fn set_path_param(payload: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    if let Some((start, end)) = param_span(payload, name) {
        return splice(payload, start, end, value);
    }
    let Some((_, path_end)) = path_span(payload) else {
        return payload.to_vec();
    };
    let mut insert = Vec::with_capacity(name.len() + value.len() + 2);
    insert.push(if query_span(payload).is_some() { b'&' } else { b'?' });
    insert.extend_from_slice(name);
    insert.push(b'=');
    insert.extend_from_slice(value);
    splice(payload, path_end, path_end, &insert)
}

/// Points the request at `host`: rewrites an absolute-form target to origin
/// form on the new host and replaces the `Host` header.
pub fn set_host(payload: &[u8], host: &[u8]) -> Vec<u8> {
    let target = path(payload);
    let rewritten = if target.starts_with(b"http://") || target.starts_with(b"https://") {
        let after_scheme = find(target, b"://").map(|i| i + 3).unwrap_or(0);
        let origin = target[after_scheme..]
            .iter()
            .position(|&b| b == b'/')
            .map(|i| target[after_scheme + i..].to_vec())
            .unwrap_or_else(|| b"/".to_vec());
        set_path(payload, &origin)
    } else {
        payload.to_vec()
    };
    set_header(&rewritten, b"Host", host)
}

fn splice(payload: &[u8], start: usize, end: usize, with: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() - (end - start) + with.len());
    out.extend_from_slice(&payload[..start]);
    out.extend_from_slice(with);
    out.extend_from_slice(&payload[end..]);
    out
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|w| w.eq_ignore_ascii_case(needle))
}
