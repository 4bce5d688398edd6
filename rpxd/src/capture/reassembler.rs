use bytes::Bytes;
use rpx_core::proto;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace};

use super::message::{LogicalMessage, MessageKey, RequestLink};
use super::packet::RawSegment;

const CONTINUE_PROBE_SUFFIX: &[u8] = b"Expect: 100-continue\r\n\r\n";

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReassemblerSettings {
    /// Port requests are sent to; segments towards it are incoming.
    pub(crate) port: u16,
    pub(crate) expire: Duration,
    pub(crate) fast_completion: bool,
}

/// Client end of a connection and the ack its response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExchangeKey {
    client: IpAddr,
    client_port: u16,
    ack: u32,
}

struct Pending {
    message: LogicalMessage,
    client: (IpAddr, u16),
    gen: u64,
    /// Ack the peer will use for the reply (requests only).
    response_ack: Option<u32>,
    /// Paired message on the other side of the exchange.
    peer: Option<MessageKey>,
    /// Wire acks of 100-continue body segments folded into this message.
    alias_acks: Vec<u32>,
    /// Sequence number the 100-continue body is expected at.
    continue_seq: Option<u32>,
}

impl Pending {
    fn new(message: LogicalMessage, client: (IpAddr, u16)) -> Self {
        Self {
            message,
            client,
            gen: 0,
            response_ack: None,
            peer: None,
            alias_acks: Vec::new(),
            continue_seq: None,
        }
    }

    fn exchange(&self, ack: u32) -> ExchangeKey {
        ExchangeKey {
            client: self.client.0,
            client_port: self.client.1,
            ack,
        }
    }
}

/// Single owner of the pending-message table.
///
/// Segments arrive over a channel and completed messages leave over another;
/// nothing else touches the table, so it needs no lock.
pub(crate) struct Reassembler {
    settings: ReassemblerSettings,
    pending: HashMap<MessageKey, Pending>,
    deadlines: VecDeque<(Instant, MessageKey, u64)>,
    next_gen: u64,
    /// Expected body seq of a 100-continue request -> request ack.
    seq_aliases: HashMap<u32, u32>,
    /// Wire ack of a 100-continue body -> request ack.
    ack_aliases: HashMap<u32, u32>,
    /// Expected response ack -> request.
    response_aliases: HashMap<ExchangeKey, MessageKey>,
    /// Response ack -> response seen before its request.
    orphan_responses: HashMap<ExchangeKey, MessageKey>,
    /// Requests already emitted whose response has not shown up yet.
    recent_requests: HashMap<ExchangeKey, (RequestLink, Instant)>,
    completed: mpsc::UnboundedSender<LogicalMessage>,
    #[cfg(test)]
    panic_on_seq: Option<u32>,
}

impl Reassembler {
    pub(crate) fn new(
        settings: ReassemblerSettings,
        completed: mpsc::UnboundedSender<LogicalMessage>,
    ) -> Self {
        Self {
            settings,
            pending: HashMap::new(),
            deadlines: VecDeque::new(),
            next_gen: 0,
            seq_aliases: HashMap::new(),
            ack_aliases: HashMap::new(),
            response_aliases: HashMap::new(),
            orphan_responses: HashMap::new(),
            recent_requests: HashMap::new(),
            completed,
            #[cfg(test)]
            panic_on_seq: None,
        }
    }

    pub(crate) async fn run(mut self, mut segments: mpsc::UnboundedReceiver<RawSegment>) {
        let mut input_open = true;
        loop {
            if !input_open && self.pending.is_empty() {
                return;
            }
            let deadline = self.deadlines.front().map(|(at, _, _)| *at);
            tokio::select! {
                segment = segments.recv(), if input_open => match segment {
                    Some(segment) => self.dispatch(segment),
                    None => input_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
            if self.completed.is_closed() {
                debug!("capture consumer gone, stopping reassembler");
                return;
            }
        }
    }

    /// Processes one segment; a panic inside is contained to that segment.
    pub(crate) fn dispatch(&mut self, segment: RawSegment) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(segment)));
        if outcome.is_err() {
            metrics::counter!("rpx_capture_dispatch_panics_total").increment(1);
            error!("segment dispatch panicked; segment dropped");
        }
    }

    fn process(&mut self, mut segment: RawSegment) {
        #[cfg(test)]
        if self.panic_on_seq == Some(segment.seq) {
            panic!("forced panic at seq {}", segment.seq);
        }
        if let Some(parent_ack) = self.seq_aliases.remove(&segment.seq) {
            let parent = MessageKey {
                ack: parent_ack,
                ..MessageKey::of(&segment)
            };
            if let Some(pending) = self.pending.get_mut(&parent) {
                pending.continue_seq = None;
                if segment.ack != parent_ack {
                    pending.alias_acks.push(segment.ack);
                }
            }
            if segment.ack != parent_ack {
                self.ack_aliases.insert(segment.ack, parent_ack);
            }
            segment.ack = parent_ack;
        } else if let Some(&parent_ack) = self.ack_aliases.get(&segment.ack) {
            segment.ack = parent_ack;
        }

        let is_incoming = segment.dst_port == self.settings.port;
        let mut continue_seq = None;
        if is_incoming && is_continue_probe(&segment.payload) {
            continue_seq = Some(segment.seq.wrapping_add(segment.payload.len() as u32));
            segment.payload = Bytes::from(proto::delete_header(&segment.payload, b"Expect"));
        }

        let key = MessageKey::of(&segment);
        let created = !self.pending.contains_key(&key);
        let client = if is_incoming {
            (segment.src_addr, segment.src_port)
        } else {
            (segment.dst_addr, segment.dst_port)
        };
        let pending = self.pending.entry(key).or_insert_with(|| {
            Pending::new(
                LogicalMessage::new(key, is_incoming, segment.captured_at),
                client,
            )
        });
        if !pending
            .message
            .append(segment.seq, segment.payload, segment.captured_at)
        {
            metrics::counter!("rpx_capture_duplicate_segments_total").increment(1);
            debug!(
                addr = %key.addr,
                port = key.port,
                ack = key.ack,
                seq = segment.seq,
                flags = ?segment.flags,
                "duplicate segment dropped"
            );
            return;
        }
        self.touch(key);

        if let Some(expected) = continue_seq {
            self.register_continue(key, expected);
        }
        if is_incoming {
            self.track_request(key);
        } else if created {
            self.link_response(key);
        }

        if self.settings.fast_completion {
            self.complete_if_finished(key);
        }
    }

    /// Re-arms the inactivity timer of `key`. Earlier deadlines queued for
    /// the same message go stale through the generation check.
    fn touch(&mut self, key: MessageKey) {
        let Some(pending) = self.pending.get_mut(&key) else {
            return;
        };
        self.next_gen += 1;
        pending.gen = self.next_gen;
        self.deadlines
            .push_back((Instant::now() + self.settings.expire, key, self.next_gen));
    }

    fn register_continue(&mut self, key: MessageKey, expected: u32) {
        // The body may have been captured before the probe.
        let early = self
            .pending
            .iter()
            .find(|(other, p)| {
                other.addr == key.addr
                    && other.port == key.port
                    && other.ack != key.ack
                    && p.message.first_seq() == Some(expected)
            })
            .map(|(other, _)| *other);

        match early {
            Some(body_key) => {
                let Some(body) = self.pending.remove(&body_key) else {
                    return;
                };
                if let Some(ack) = body.response_ack {
                    let exchange = body.exchange(ack);
                    if self.response_aliases.get(&exchange) == Some(&body_key) {
                        self.response_aliases.remove(&exchange);
                    }
                }
                self.ack_aliases.insert(body_key.ack, key.ack);
                if let Some(parent) = self.pending.get_mut(&key) {
                    parent.message.absorb(body.message);
                    parent.alias_acks.push(body_key.ack);
                    parent.alias_acks.extend(body.alias_acks);
                }
                self.touch(key);
            }
            None => {
                self.seq_aliases.insert(expected, key.ack);
                if let Some(parent) = self.pending.get_mut(&key) {
                    parent.continue_seq = Some(expected);
                }
            }
        }
    }

    fn track_request(&mut self, key: MessageKey) {
        let Some(pending) = self.pending.get_mut(&key) else {
            return;
        };
        let Some(next) = pending.message.next_seq() else {
            return;
        };
        if pending.response_ack == Some(next) {
            return;
        }
        let previous = pending.response_ack.replace(next);
        let previous = previous.map(|ack| pending.exchange(ack));
        let exchange = pending.exchange(next);
        if let Some(previous) = previous {
            if self.response_aliases.get(&previous) == Some(&key) {
                self.response_aliases.remove(&previous);
            }
        }
        self.response_aliases.insert(exchange, key);
        if let Some(response_key) = self.orphan_responses.remove(&exchange) {
            self.pair(key, response_key);
        }
    }

    fn link_response(&mut self, key: MessageKey) {
        let Some(exchange) = self.pending.get(&key).map(|p| p.exchange(key.ack)) else {
            return;
        };
        if let Some(request_key) = self.response_aliases.get(&exchange).copied() {
            self.pair(request_key, key);
            return;
        }
        if let Some((link, _)) = self.recent_requests.remove(&exchange) {
            if let Some(response) = self.pending.get_mut(&key) {
                response.message.request = Some(link);
            }
            return;
        }
        self.orphan_responses.insert(exchange, key);
    }

    fn pair(&mut self, request_key: MessageKey, response_key: MessageKey) {
        let Some(request) = self.pending.get_mut(&request_key) else {
            return;
        };
        request.peer = Some(response_key);
        let link = RequestLink {
            uuid: request.message.uuid(),
            started_at: request.message.started_at,
        };
        if let Some(response) = self.pending.get_mut(&response_key) {
            response.message.request = Some(link);
            response.peer = Some(request_key);
        }
    }

    /// A response is only released early once its request has left the
    /// table, so requests are always emitted first.
    fn complete_if_finished(&mut self, key: MessageKey) {
        let Some(pending) = self.pending.get(&key) else {
            return;
        };
        if !pending.message.is_finished() {
            return;
        }
        let peer = pending.peer;
        if pending.message.is_incoming {
            self.complete(key);
            if let Some(response_key) = peer {
                if self
                    .pending
                    .get(&response_key)
                    .is_some_and(|r| r.message.is_finished())
                {
                    self.complete(response_key);
                }
            }
        } else if peer.map_or(true, |request| !self.pending.contains_key(&request)) {
            self.complete(key);
        }
    }

    fn expire(&mut self, now: Instant) {
        self.recent_requests.retain(|_, (_, until)| *until > now);
        while let Some(&(deadline, key, gen)) = self.deadlines.front() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_front();
            let live = self.pending.get(&key).is_some_and(|p| p.gen == gen);
            if live {
                self.complete(key);
            }
        }
    }

    fn complete(&mut self, key: MessageKey) {
        let Some(pending) = self.pending.remove(&key) else {
            return;
        };
        for ack in &pending.alias_acks {
            self.ack_aliases.remove(ack);
        }
        if let Some(seq) = pending.continue_seq {
            self.seq_aliases.remove(&seq);
        }
        if let Some(ack) = pending.response_ack {
            let exchange = pending.exchange(ack);
            if self.response_aliases.get(&exchange) == Some(&key) {
                self.response_aliases.remove(&exchange);
            }
            if pending.message.is_incoming && pending.peer.is_none() {
                let link = RequestLink {
                    uuid: pending.message.uuid(),
                    started_at: pending.message.started_at,
                };
                self.recent_requests
                    .insert(exchange, (link, Instant::now() + self.settings.expire));
            }
        }
        let exchange = pending.exchange(key.ack);
        if self.orphan_responses.get(&exchange) == Some(&key) {
            self.orphan_responses.remove(&exchange);
        }

        let message = pending.message;
        let direction = if message.is_incoming { "request" } else { "response" };
        if !message.is_incoming && message.request.is_none() {
            metrics::counter!("rpx_capture_unpaired_responses_total").increment(1);
            debug!(ack = key.ack, "response without a captured request dropped");
            return;
        }
        metrics::counter!("rpx_capture_messages_total", "direction" => direction).increment(1);
        trace!(
            direction,
            addr = %key.addr,
            port = key.port,
            ack = key.ack,
            segments = message.segment_count(),
            bytes = message.size(),
            "message complete"
        );
        let _ = self.completed.send(message);
    }
}

/// Header-only `POST` that waits for `100 Continue` before sending its body.
fn is_continue_probe(payload: &[u8]) -> bool {
    payload.starts_with(b"POST") && payload.ends_with(CONTINUE_PROBE_SUFFIX)
}
