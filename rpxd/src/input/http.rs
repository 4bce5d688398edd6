use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rpx_core::config::InputConfig;
use rpx_core::wire::{self, PayloadKind};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::plugins::Source;

const RECORD_QUEUE: usize = 10_000;
const READ_CHUNK: usize = 16 * 1024;
const MAX_REQUEST_HEADERS: usize = 128;
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;
const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";
const OK_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
const BAD_REQUEST_REPLY: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

pub(crate) fn build(cfg: &InputConfig) -> Result<Box<dyn Source>> {
    let address = cfg
        .address
        .as_deref()
        .ok_or_else(|| anyhow!("http input requires address"))?;
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("invalid http input address {address}"))?;
    Ok(Box::new(HttpInput::bind(cfg.display_name(), addr)?))
}

/// Plain HTTP endpoint: every request is answered with an empty `200` and
/// becomes a request record stamped with the time it arrived.
///
/// Requests are dropped, not queued, while the emitter lags
/// `RECORD_QUEUE` records behind.
pub(crate) struct HttpInput {
    name: String,
    local_addr: SocketAddr,
    records: mpsc::Receiver<Bytes>,
}

impl HttpInput {
    pub(crate) fn bind(name: String, addr: SocketAddr) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("failed to bind http input {addr}"))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(RECORD_QUEUE);
        tokio::spawn(accept_loop(name.clone(), listener, tx));
        info!(input = %name, listen = %local_addr, "http input listening");
        Ok(Self {
            name,
            local_addr,
            records: rx,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(name: String, listener: TcpListener, tx: mpsc::Sender<Bytes>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = ?err, input = %name, "http input accept failed");
                continue;
            }
        };
        if tx.is_closed() {
            return;
        }
        let tx = tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &name, &tx).await {
                debug!(error = ?err, input = %name, peer = %peer, "http input connection failed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    name: &str,
    tx: &mpsc::Sender<Bytes>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        let framed = match frame_request(&buf) {
            Ok(framed) => framed,
            Err(err) => {
                let _ = stream.write_all(BAD_REQUEST_REPLY).await;
                return Err(err);
            }
        };
        let Framed::Complete { len, close } = framed else {
            if buf.len() >= MAX_REQUEST_BYTES {
                let _ = stream.write_all(BAD_REQUEST_REPLY).await;
                return Err(anyhow!("request exceeds {MAX_REQUEST_BYTES} bytes"));
            }
            buf.reserve(READ_CHUNK);
            if stream.read_buf(&mut buf).await.context("read failed")? == 0 {
                return Ok(());
            }
            continue;
        };

        let request = buf.split_to(len).freeze();
        stream.write_all(OK_REPLY).await.context("reply failed")?;
        let record = wire::encode_record(
            PayloadKind::Request,
            &wire::random_uuid(),
            now_nanos(),
            &request,
        );
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("rpx_http_input_dropped_total", "input" => name.to_string())
                    .increment(1);
                debug!(input = %name, "record queue full; request dropped");
            }
            Err(TrySendError::Closed(_)) => return Ok(()),
        }
        if close {
            return Ok(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Framed {
    Partial,
    /// The first `len` buffered bytes are one whole request.
    Complete { len: usize, close: bool },
}

/// Frames the first request in `buf` by `Content-Length` or chunked
/// encoding.
fn frame_request(buf: &[u8]) -> Result<Framed> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_len = match parsed.parse(buf).context("malformed request")? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(Framed::Partial),
    };
    let mut length = 0;
    let mut chunked = false;
    let mut close = parsed.version == Some(0);
    for header in parsed.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| anyhow!("bad content-length"))?;
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = header.value.to_ascii_lowercase().ends_with(b"chunked");
        } else if header.name.eq_ignore_ascii_case("connection") {
            close = header.value.eq_ignore_ascii_case(b"close");
        }
    }

    let body = &buf[head_len..];
    let body_len = if chunked {
        chunked_body_len(body)
    } else {
        (body.len() >= length).then_some(length)
    };
    Ok(match body_len {
        Some(body_len) => Framed::Complete {
            len: head_len + body_len,
            close,
        },
        None => Framed::Partial,
    })
}

/// Length of a chunked body up to and including its last-chunk line.
/// Trailers are not supported.
fn chunked_body_len(body: &[u8]) -> Option<usize> {
    if body.starts_with(CHUNKED_TERMINATOR) {
        return Some(CHUNKED_TERMINATOR.len());
    }
    body.windows(CHUNKED_TERMINATOR.len() + 2)
        .position(|w| w.starts_with(b"\r\n") && w.ends_with(CHUNKED_TERMINATOR))
        .map(|at| at + 2 + CHUNKED_TERMINATOR.len())
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl Source for HttpInput {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        Ok(self.records.recv().await)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
