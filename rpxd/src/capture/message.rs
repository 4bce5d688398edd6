use bytes::{Bytes, BytesMut};
use rpx_core::proto;
use rpx_core::wire;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use super::packet::RawSegment;

/// Every segment of one request (or one response) carries the same ack, so
/// `(addr, port, ack)` names a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MessageKey {
    pub(crate) addr: IpAddr,
    pub(crate) port: u16,
    pub(crate) ack: u32,
}

impl MessageKey {
    pub(crate) fn of(segment: &RawSegment) -> Self {
        Self {
            addr: segment.src_addr,
            port: segment.src_port,
            ack: segment.ack,
        }
    }
}

/// Request side of a request/response pair, as seen by the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestLink {
    pub(crate) uuid: String,
    pub(crate) started_at: SystemTime,
}

/// One HTTP request or response reassembled from TCP segments.
#[derive(Debug)]
pub(crate) struct LogicalMessage {
    pub(crate) key: MessageKey,
    pub(crate) is_incoming: bool,
    pub(crate) started_at: SystemTime,
    pub(crate) updated_at: SystemTime,
    pub(crate) request: Option<RequestLink>,
    segments: BTreeMap<u32, Bytes>,
}

impl LogicalMessage {
    pub(crate) fn new(key: MessageKey, is_incoming: bool, started_at: SystemTime) -> Self {
        Self {
            key,
            is_incoming,
            started_at,
            updated_at: started_at,
            request: None,
            segments: BTreeMap::new(),
        }
    }

    /// Stores a segment payload. Returns `false` for a sequence number that
    /// is already present.
    pub(crate) fn append(&mut self, seq: u32, payload: Bytes, at: SystemTime) -> bool {
        if self.segments.contains_key(&seq) {
            return false;
        }
        self.segments.insert(seq, payload);
        if at > self.updated_at {
            self.updated_at = at;
        }
        true
    }

    /// Moves all segments of `other` into this message.
    pub(crate) fn absorb(&mut self, other: LogicalMessage) {
        for (seq, payload) in other.segments {
            self.append(seq, payload, other.updated_at);
        }
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn first_seq(&self) -> Option<u32> {
        self.segments.keys().next().copied()
    }

    /// Sequence number right after the highest segment; the peer acks this
    /// value in its reply.
    pub(crate) fn next_seq(&self) -> Option<u32> {
        self.segments
            .iter()
            .next_back()
            .map(|(seq, payload)| seq.wrapping_add(payload.len() as u32))
    }

    fn first_payload(&self) -> &[u8] {
        self.segments.values().next().map(|b| &b[..]).unwrap_or(&[])
    }

    /// Concatenated payload in ascending sequence order.
    pub(crate) fn bytes(&self) -> Bytes {
        if self.segments.len() == 1 {
            return self.first_payload_bytes();
        }
        let mut out = BytesMut::with_capacity(self.size());
        for payload in self.segments.values() {
            out.extend_from_slice(payload);
        }
        out.freeze()
    }

    fn first_payload_bytes(&self) -> Bytes {
        self.segments.values().next().cloned().unwrap_or_default()
    }

    pub(crate) fn size(&self) -> usize {
        self.segments.values().map(Bytes::len).sum()
    }

    /// Body bytes seen so far: everything past the header block of the first
    /// segment plus every later segment.
    pub(crate) fn body_size(&self) -> usize {
        let mut iter = self.segments.values();
        let Some(first) = iter.next() else {
            return 0;
        };
        proto::body(first).len() + iter.map(Bytes::len).sum::<usize>()
    }

    /// Structural completion check used by the fast-completion path.
    ///
    /// Chunked bodies are never inspected; they complete on the inactivity
    /// timer. Responses without a paired request also wait for the timer.
    pub(crate) fn is_finished(&self) -> bool {
        let head = self.first_payload();
        if head.len() < 4 {
            return true;
        }
        if self.is_incoming {
            match &head[..4] {
                b"GET " | b"OPTI" | b"HEAD" => proto::has_full_headers(head),
                b"POST" | b"PUT " | b"PATC" => {
                    proto::has_full_headers(head)
                        && !proto::is_chunked(head)
                        && proto::content_length(head) == Some(self.body_size())
                }
                _ => false,
            }
        } else {
            if self.request.is_none() || !proto::has_full_headers(head) {
                return false;
            }
            match proto::content_length(head) {
                Some(len) => len == self.body_size(),
                None => {
                    proto::header(head, b"Content-Length").is_none() && !proto::is_chunked(head)
                }
            }
        }
    }

    /// Identifier shared by a request and the responses paired with it.
    pub(crate) fn uuid(&self) -> String {
        match &self.request {
            Some(link) => link.uuid.clone(),
            None => wire::message_uuid(unix_nanos(self.started_at), self.key.ack),
        }
    }

    /// Wire record for this message: start time for requests, round trip
    /// against the paired request for responses.
    pub(crate) fn to_record(&self) -> Bytes {
        let (kind, timing) = if self.is_incoming {
            (wire::PayloadKind::Request, unix_nanos(self.started_at))
        } else {
            let rtt = self
                .request
                .as_ref()
                .and_then(|link| self.started_at.duration_since(link.started_at).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or_default();
            (wire::PayloadKind::Response, rtt)
        };
        wire::encode_record(kind, &self.uuid(), timing, &self.bytes())
    }
}

pub(crate) fn unix_nanos(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
