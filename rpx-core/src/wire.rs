//! Record framing shared by capture files and the TCP transport.
//!
//! A record is `<type> <uuid> <timing>\n<raw http>`. Concatenated records are
//! split by [`PAYLOAD_SEPARATOR`].

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PAYLOAD_SEPARATOR: &[u8] = "\n🐵🙈🙉\n".as_bytes();

/// Width of the hex identifier carried in every record header.
pub const UUID_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Request,
    Response,
    ReplayedResponse,
}

impl PayloadKind {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Request => b'1',
            Self::Response => b'2',
            Self::ReplayedResponse => b'3',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'1' => Some(Self::Request),
            b'2' => Some(Self::Response),
            b'3' => Some(Self::ReplayedResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record has no header line")]
    MissingHeader,
    #[error("unknown payload type {0:#04x}")]
    UnknownKind(u8),
    #[error("malformed record header: {0}")]
    Malformed(&'static str),
}

/// Parsed header of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub kind: PayloadKind,
    pub uuid: String,
    /// Start time in unix nanos for requests, round trip nanos for responses.
    pub timing: i64,
    /// Offset of the raw HTTP bytes.
    pub body_offset: usize,
}

pub fn payload_header(kind: PayloadKind, uuid: &str, timing: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(UUID_LEN + 24);
    out.push(kind.as_byte());
    out.push(b' ');
    out.extend_from_slice(uuid.as_bytes());
    out.push(b' ');
    out.extend_from_slice(timing.to_string().as_bytes());
    out.push(b'\n');
    out
}

/// Builds a full record from its parts.
pub fn encode_record(kind: PayloadKind, uuid: &str, timing: i64, body: &[u8]) -> Bytes {
    let mut out = payload_header(kind, uuid, timing);
    out.extend_from_slice(body);
    Bytes::from(out)
}

pub fn parse_header(payload: &[u8]) -> Result<RecordMeta, RecordError> {
    let line_end = payload
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(RecordError::MissingHeader)?;
    let line = std::str::from_utf8(&payload[..line_end])
        .map_err(|_| RecordError::Malformed("header is not utf-8"))?;
    let mut fields = line.split(' ');
    let kind = fields
        .next()
        .filter(|f| f.len() == 1)
        .ok_or(RecordError::Malformed("type field"))?;
    let kind_byte = kind.as_bytes()[0];
    let kind = PayloadKind::from_byte(kind_byte).ok_or(RecordError::UnknownKind(kind_byte))?;
    let uuid = fields
        .next()
        .filter(|f| !f.is_empty())
        .ok_or(RecordError::Malformed("uuid field"))?;
    let timing = fields
        .next()
        .and_then(|f| f.parse::<i64>().ok())
        .ok_or(RecordError::Malformed("timing field"))?;
    Ok(RecordMeta {
        kind,
        uuid: uuid.to_string(),
        timing,
        body_offset: line_end + 1,
    })
}

/// Raw HTTP bytes of a record; the whole payload if it has no header line.
pub fn payload_body(payload: &Bytes) -> Bytes {
    match payload.iter().position(|&b| b == b'\n') {
        Some(idx) => payload.slice(idx + 1..),
        None => payload.clone(),
    }
}

pub fn is_request(payload: &[u8]) -> bool {
    payload.first().copied() == Some(PayloadKind::Request.as_byte())
}

fn hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Random identifier for synthetic records.
pub fn random_uuid() -> String {
    let mut raw = [0u8; UUID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut raw);
    hex(&raw)
}

/// Stable identifier of a captured request, shared with its responses.
pub fn message_uuid(start_nanos: i64, ack: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(start_nanos.to_be_bytes());
    hasher.update(ack.to_be_bytes());
    let digest = hasher.finalize();
    hex(&digest[..UUID_LEN / 2])
}

/// Incremental splitter for separator-delimited record streams.
#[derive(Debug, Default)]
pub struct RecordScanner {
    buf: BytesMut,
}

impl RecordScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete record, if a separator has been seen.
    pub fn next_record(&mut self) -> Option<Bytes> {
        loop {
            let idx = crate::proto::find(&self.buf, PAYLOAD_SEPARATOR)?;
            let record = self.buf.split_to(idx).freeze();
            let _ = self.buf.split_to(PAYLOAD_SEPARATOR.len());
            if !record.is_empty() {
                return Some(record);
            }
        }
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = self.buf.split().freeze();
        let trimmed = rest.iter().all(|b| b.is_ascii_whitespace());
        (!trimmed).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let uuid = "a".repeat(UUID_LEN);
        let record = encode_record(PayloadKind::Request, &uuid, 1_500, b"GET / HTTP/1.1\r\n\r\n");
        assert!(record.starts_with(format!("1 {uuid} 1500\n").as_bytes()));
        let meta = parse_header(&record).expect("meta");
        assert_eq!(meta.kind, PayloadKind::Request);
        assert_eq!(meta.uuid, uuid);
        assert_eq!(meta.timing, 1_500);
        assert_eq!(&record[meta.body_offset..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(payload_body(&record), Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"));
        assert!(is_request(&record));
    }

    #[test]
    fn rejects_bad_headers() {
        assert_eq!(parse_header(b"no newline"), Err(RecordError::MissingHeader));
        assert_eq!(
            parse_header(b"7 abc 1\nGET"),
            Err(RecordError::UnknownKind(b'7'))
        );
        assert_eq!(
            parse_header(b"2 abc soon\nHTTP/1.1"),
            Err(RecordError::Malformed("timing field"))
        );
    }

    #[test]
    fn uuids_are_fixed_width_hex() {
        let random = random_uuid();
        assert_eq!(random.len(), UUID_LEN);
        assert!(random.bytes().all(|b| b.is_ascii_hexdigit()));
        let a = message_uuid(10, 100);
        assert_eq!(a.len(), UUID_LEN);
        assert_eq!(a, message_uuid(10, 100));
        assert_ne!(a, message_uuid(10, 101));
    }

    #[test]
    fn scanner_splits_across_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"1 x 1\nGET /a HTTP/1.1\r\n\r\n");
        stream.extend_from_slice(PAYLOAD_SEPARATOR);
        stream.extend_from_slice(b"1 y 2\nGET /b HTTP/1.1\r\n\r\n");
        stream.extend_from_slice(PAYLOAD_SEPARATOR);
        stream.extend_from_slice(b"1 z 3\nGET /c");

        let mut scanner = RecordScanner::new();
        let mut records = Vec::new();
        for chunk in stream.chunks(5) {
            scanner.push(chunk);
            while let Some(record) = scanner.next_record() {
                records.push(record);
            }
        }
        assert_eq!(records.len(), 2);
        assert!(records[0].ends_with(b"GET /a HTTP/1.1\r\n\r\n"));
        assert!(records[1].starts_with(b"1 y 2\n"));
        assert_eq!(scanner.finish(), Some(Bytes::from_static(b"1 z 3\nGET /c")));
        assert_eq!(scanner.finish(), None);
    }
}
