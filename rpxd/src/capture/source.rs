use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::PacketSink;

/// Blocking producer of link-stripped TCP segments.
pub(crate) trait PacketSource: Send + 'static {
    fn describe(&self) -> String;

    /// Pushes packets into `sink` until the source is exhausted or the
    /// sink's reassembler has gone away. Runs on a blocking thread.
    fn run(self: Box<Self>, sink: PacketSink) -> Result<()>;
}

/// Live capture through a raw IPv4 socket. Needs CAP_NET_RAW.
pub(crate) struct RawSocketSource {
    socket: Socket,
    bind: IpAddr,
    snaplen: usize,
}

impl RawSocketSource {
    pub(crate) fn open(host: IpAddr, snaplen: usize) -> Result<Self> {
        if !host.is_ipv4() {
            return Err(anyhow!("raw socket capture supports IPv4 only, got {host}"));
        }
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
            .context("failed to open raw socket (requires CAP_NET_RAW)")?;
        if !host.is_unspecified() {
            socket
                .bind(&SockAddr::from(SocketAddr::new(host, 0)))
                .with_context(|| format!("failed to bind raw socket to {host}"))?;
        }
        Ok(Self {
            socket,
            bind: host,
            snaplen,
        })
    }
}

impl PacketSource for RawSocketSource {
    fn describe(&self) -> String {
        format!("raw_socket:{}", self.bind)
    }

    fn run(self: Box<Self>, sink: PacketSink) -> Result<()> {
        let mut buf = vec![0u8; self.snaplen];
        let mut socket = &self.socket;
        loop {
            let n = socket.read(&mut buf).context("raw socket read failed")?;
            let Some((src, dst, tcp)) = strip_ip(&buf[..n]) else {
                continue;
            };
            if !sink.push(src, dst, Bytes::copy_from_slice(tcp), SystemTime::now()) {
                return Ok(());
            }
        }
    }
}

/// Offline capture from a classic pcap file.
pub(crate) struct PcapFileSource {
    path: PathBuf,
    reader: PcapReader<File>,
}

impl PcapFileSource {
    pub(crate) fn open(path: PathBuf) -> Result<Self> {
        let file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let reader = PcapReader::new(file)
            .with_context(|| format!("{} is not a pcap file", path.display()))?;
        let datalink = reader.header().datalink;
        if link_header_len(datalink, &[]).is_none() {
            return Err(anyhow!(
                "{}: unsupported pcap link type {:?}",
                path.display(),
                datalink
            ));
        }
        Ok(Self { path, reader })
    }
}

impl PacketSource for PcapFileSource {
    fn describe(&self) -> String {
        format!("pcap_file:{}", self.path.display())
    }

    fn run(mut self: Box<Self>, sink: PacketSink) -> Result<()> {
        let datalink = self.reader.header().datalink;
        let mut packets = 0u64;
        while let Some(packet) = self.reader.next_packet() {
            let packet =
                packet.with_context(|| format!("pcap read failed: {}", self.path.display()))?;
            packets += 1;
            let Some((src, dst, tcp)) = strip_link(datalink, &packet.data) else {
                continue;
            };
            let captured_at = UNIX_EPOCH + packet.timestamp;
            if !sink.push(src, dst, Bytes::copy_from_slice(tcp), captured_at) {
                return Ok(());
            }
        }
        info!(file = %self.path.display(), packets, "pcap file exhausted");
        Ok(())
    }
}

/// Bytes to skip before the IP header, or `None` for link types that are
/// not understood.
fn link_header_len(datalink: DataLink, frame: &[u8]) -> Option<usize> {
    match datalink {
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Some(0),
        DataLink::NULL | DataLink::LOOP => Some(4),
        DataLink::LINUX_SLL => Some(16),
        DataLink::ETHERNET => {
            let mut offset = 14;
            // 802.1Q / QinQ tags
            while frame.len() >= offset
                && matches!(
                    u16::from_be_bytes([frame[offset - 2], frame[offset - 1]]),
                    0x8100 | 0x88a8
                )
            {
                offset += 4;
            }
            Some(offset)
        }
        _ => None,
    }
}

pub(crate) fn strip_link(datalink: DataLink, frame: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let offset = link_header_len(datalink, frame)?;
    strip_ip(frame.get(offset..)?)
}

/// Source address, destination address and TCP bytes of an IP packet.
pub(crate) fn strip_ip(packet: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let sliced = match SlicedPacket::from_ip(packet) {
        Ok(sliced) => sliced,
        Err(err) => {
            debug!(error = ?err, "dropping undecodable ip packet");
            return None;
        }
    };
    if !matches!(sliced.transport, Some(TransportSlice::Tcp(_))) {
        return None;
    }
    match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => Some((
            IpAddr::from(ipv4.header().source()),
            IpAddr::from(ipv4.header().destination()),
            ipv4.payload().payload,
        )),
        Some(NetSlice::Ipv6(ipv6)) => Some((
            IpAddr::from(ipv6.header().source()),
            IpAddr::from(ipv6.header().destination()),
            ipv6.payload().payload,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn ethernet_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([10, 0, 0, 7], [10, 0, 0, 1], 64)
            .tcp(40_000, 80, 1_000, 64_240)
            .ack(77)
            .psh();
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).expect("build frame");
        out
    }

    #[test]
    fn strips_ethernet_and_ipv4() {
        let frame = ethernet_frame(b"GET / HTTP/1.1\r\n\r\n");
        let (src, dst, tcp) = strip_link(DataLink::ETHERNET, &frame).expect("tcp");
        assert_eq!(src, IpAddr::from([10, 0, 0, 7]));
        assert_eq!(dst, IpAddr::from([10, 0, 0, 1]));
        assert_eq!(u16::from_be_bytes([tcp[2], tcp[3]]), 80);
        assert!(tcp.ends_with(b"GET / HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn strips_raw_ip() {
        let frame = ethernet_frame(b"x");
        let (src, _, tcp) = strip_link(DataLink::RAW, &frame[14..]).expect("tcp");
        assert_eq!(src, IpAddr::from([10, 0, 0, 7]));
        assert_eq!(tcp.len(), 21);
    }

    #[test]
    fn unknown_link_types_are_rejected() {
        assert!(link_header_len(DataLink::Unknown(4242), &[]).is_none());
        assert!(strip_link(DataLink::ETHERNET, &[0u8; 10]).is_none());
    }
}
