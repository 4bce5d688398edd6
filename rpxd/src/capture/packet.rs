use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;
use thiserror::Error;

const MIN_TCP_HEADER_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum SegmentError {
    #[error("segment of {len} bytes is shorter than a tcp header")]
    TooShort { len: usize },
    #[error("segment declares a {header_len} byte header but carries {len} bytes")]
    TruncatedHeader { header_len: usize, len: usize },
}

/// TCP control bits from the data-offset/flags word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct TcpFlags(u16);

impl TcpFlags {
    pub(crate) const FIN: u16 = 0x001;
    pub(crate) const SYN: u16 = 0x002;
    pub(crate) const RST: u16 = 0x004;
    pub(crate) const PSH: u16 = 0x008;
    pub(crate) const ACK: u16 = 0x010;
    pub(crate) const URG: u16 = 0x020;
    pub(crate) const ECE: u16 = 0x040;
    pub(crate) const CWR: u16 = 0x080;
    pub(crate) const NS: u16 = 0x100;

    pub(crate) fn from_bits(bits: u16) -> Self {
        Self(bits & 0x1ff)
    }

    pub(crate) fn contains(self, bit: u16) -> bool {
        self.0 & bit == bit
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 9] = [
            (TcpFlags::NS, "NS"),
            (TcpFlags::CWR, "CWR"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join("|"))
    }
}

/// One parsed TCP segment. Immutable once built; the payload shares the
/// capture buffer.
#[derive(Debug, Clone)]
pub(crate) struct RawSegment {
    pub(crate) src_addr: IpAddr,
    pub(crate) dst_addr: IpAddr,
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
    pub(crate) seq: u32,
    pub(crate) ack: u32,
    /// Header length in 32-bit words.
    pub(crate) data_offset: u8,
    pub(crate) flags: TcpFlags,
    pub(crate) payload: Bytes,
    pub(crate) captured_at: SystemTime,
}

impl RawSegment {
    /// Parses a TCP segment whose IP header has already been stripped.
    pub(crate) fn parse(
        src_addr: IpAddr,
        dst_addr: IpAddr,
        raw: Bytes,
        captured_at: SystemTime,
    ) -> Result<Self, SegmentError> {
        if raw.len() < MIN_TCP_HEADER_LEN {
            return Err(SegmentError::TooShort { len: raw.len() });
        }
        let src_port = u16::from_be_bytes([raw[0], raw[1]]);
        let dst_port = u16::from_be_bytes([raw[2], raw[3]]);
        let seq = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ack = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let data_offset = (raw[12] & 0xf0) >> 4;
        let flags = TcpFlags::from_bits(u16::from_be_bytes([raw[12], raw[13]]));

        let header_len = usize::from(data_offset) * 4;
        if header_len < MIN_TCP_HEADER_LEN || raw.len() < header_len {
            return Err(SegmentError::TruncatedHeader {
                header_len,
                len: raw.len(),
            });
        }
        Ok(Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            seq,
            ack,
            data_offset,
            flags,
            payload: raw.slice(header_len..),
            captured_at,
        })
    }

    pub(crate) fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn build_segment(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u16,
    payload: &[u8],
) -> Bytes {
    let mut raw = Vec::with_capacity(MIN_TCP_HEADER_LEN + payload.len());
    raw.extend_from_slice(&src_port.to_be_bytes());
    raw.extend_from_slice(&dst_port.to_be_bytes());
    raw.extend_from_slice(&seq.to_be_bytes());
    raw.extend_from_slice(&ack.to_be_bytes());
    let word = (5u16 << 12) | (flags & 0x1ff);
    raw.extend_from_slice(&word.to_be_bytes());
    raw.extend_from_slice(&64_240u16.to_be_bytes());
    raw.extend_from_slice(&[0, 0, 0, 0]);
    raw.extend_from_slice(payload);
    Bytes::from(raw)
}
