//! Passive capture: raw TCP segments in, reassembled HTTP messages out.

mod message;
mod packet;
mod reassembler;
mod source;

use anyhow::Result;
use bytes::Bytes;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) use message::LogicalMessage;
pub(crate) use source::{PacketSource, PcapFileSource, RawSocketSource};

use packet::RawSegment;
use reassembler::{Reassembler, ReassemblerSettings};

#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureSettings {
    pub(crate) port: u16,
    pub(crate) expire: Duration,
    pub(crate) track_response: bool,
    pub(crate) fast_completion: bool,
}

/// Entry point for packet sources. Parses each segment and forwards the
/// ones that belong to the captured port.
#[derive(Clone)]
pub(crate) struct PacketSink {
    port: u16,
    track_response: bool,
    segments: mpsc::UnboundedSender<RawSegment>,
}

impl PacketSink {
    /// `tcp` starts at the TCP header. Returns `false` once the reassembler
    /// has stopped.
    pub(crate) fn push(
        &self,
        src_addr: IpAddr,
        dst_addr: IpAddr,
        tcp: Bytes,
        captured_at: SystemTime,
    ) -> bool {
        metrics::counter!("rpx_capture_segments_total").increment(1);
        let segment = match RawSegment::parse(src_addr, dst_addr, tcp, captured_at) {
            Ok(segment) => segment,
            Err(err) => {
                metrics::counter!("rpx_capture_segments_dropped_total").increment(1);
                debug!(error = %err, addr = %src_addr, "malformed segment dropped");
                return !self.segments.is_closed();
            }
        };
        let incoming = segment.dst_port == self.port;
        let outgoing = self.track_response && segment.src_port == self.port;
        if !(incoming || outgoing) || !segment.has_payload() {
            return !self.segments.is_closed();
        }
        self.segments.send(segment).is_ok()
    }
}

/// Owns the reassembler task and the packet sources feeding it.
pub(crate) struct CaptureListener {
    sink: PacketSink,
    messages: mpsc::UnboundedReceiver<LogicalMessage>,
}

impl CaptureListener {
    /// Spawns the reassembler on the current runtime.
    pub(crate) fn start(settings: CaptureSettings) -> Self {
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let reassembler = Reassembler::new(
            ReassemblerSettings {
                port: settings.port,
                expire: settings.expire,
                fast_completion: settings.fast_completion,
            },
            message_tx,
        );
        tokio::spawn(reassembler.run(segment_rx));
        Self {
            sink: PacketSink {
                port: settings.port,
                track_response: settings.track_response,
                segments: segment_tx,
            },
            messages: message_rx,
        }
    }

    pub(crate) fn packet_sink(&self) -> PacketSink {
        self.sink.clone()
    }

    /// Runs `source` on a blocking thread for the life of the process.
    pub(crate) fn attach(&self, source: Box<dyn PacketSource>) -> Result<()> {
        let sink = self.packet_sink();
        let name = source.describe();
        info!(source = %name, "packet source attached");
        let handle = tokio::runtime::Handle::try_current()?;
        handle.spawn_blocking(move || match source.run(sink) {
            Ok(()) => info!(source = %name, "packet source finished"),
            Err(err) => warn!(error = ?err, source = %name, "packet source failed"),
        });
        Ok(())
    }

    /// Next completed message. `None` once every source has finished and
    /// the reassembler has flushed its table.
    pub(crate) async fn receive(&mut self) -> Option<LogicalMessage> {
        self.messages.recv().await
    }

    /// Drops the listener's own sink so `receive` ends once the attached
    /// sources are done.
    pub(crate) fn seal(&mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        self.sink.segments = closed;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    pub(crate) use super::packet::{build_segment, TcpFlags};
}
