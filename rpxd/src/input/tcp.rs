use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::InputConfig;
use rpx_core::wire::RecordScanner;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::plugins::Source;

const RECORD_QUEUE: usize = 1024;
const READ_CHUNK: usize = 64 * 1024;

pub(crate) fn build(cfg: &InputConfig) -> Result<Box<dyn Source>> {
    let address = cfg
        .address
        .as_deref()
        .ok_or_else(|| anyhow!("tcp input requires address"))?;
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("invalid tcp input address {address}"))?;
    Ok(Box::new(TcpInput::bind(cfg.display_name(), addr)?))
}

/// Receives separator-framed records from `tcp` outputs of other rpxd
/// processes.
pub(crate) struct TcpInput {
    name: String,
    local_addr: SocketAddr,
    records: mpsc::Receiver<Bytes>,
}

impl TcpInput {
    pub(crate) fn bind(name: String, addr: SocketAddr) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("failed to bind tcp input {addr}"))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(RECORD_QUEUE);
        tokio::spawn(accept_loop(name.clone(), listener, tx));
        info!(input = %name, listen = %local_addr, "tcp input listening");
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
                warn!(error = ?err, input = %name, "tcp input accept failed");
                continue;
            }
        };
        if tx.is_closed() {
            return;
        }
        debug!(input = %name, peer = %peer, "tcp input connection");
        let tx = tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            if let Err(err) = read_connection(stream, &tx).await {
                warn!(error = ?err, input = %name, peer = %peer, "tcp input connection failed");
            }
        });
    }
}

async fn read_connection(mut stream: TcpStream, tx: &mpsc::Sender<Bytes>) -> Result<()> {
    let mut scanner = RecordScanner::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await.context("read failed")?;
        if n == 0 {
            if let Some(rest) = scanner.finish() {
                let _ = tx.send(rest).await;
            }
            return Ok(());
        }
        scanner.push(&chunk[..n]);
        while let Some(record) = scanner.next_record() {
            if tx.send(record).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Source for TcpInput {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        Ok(self.records.recv().await)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpx_core::wire::PAYLOAD_SEPARATOR;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn records_from_several_connections() {
        let mut input =
            TcpInput::bind("tcp".into(), "127.0.0.1:0".parse().expect("addr")).expect("bind");
        let addr = input.local_addr();

        let mut first = TcpStream::connect(addr).await.expect("connect");
        first.write_all(b"1 a 1\nGET /a HTTP/1.1\r\n\r\n").await.expect("write");
        first.write_all(PAYLOAD_SEPARATOR).await.expect("write");
        // split in the middle of the separator
        first.write_all(b"1 b 2\nGET /b HTTP/1.1\r\n\r\n\n\xf0\x9f").await.expect("write");
        first.write_all(&PAYLOAD_SEPARATOR[3..]).await.expect("write");

        let a = input.read().await.expect("read").expect("record");
        let b = input.read().await.expect("read").expect("record");
        assert!(a.starts_with(b"1 a 1\nGET /a"));
        assert!(b.starts_with(b"1 b 2\nGET /b"));

        let mut second = TcpStream::connect(addr).await.expect("connect");
        second.write_all(b"1 c 3\nGET /c HTTP/1.1\r\n\r\n").await.expect("write");
        drop(second);
        let c = input.read().await.expect("read").expect("unterminated record at eof");
        assert!(c.starts_with(b"1 c 3\nGET /c"));
    }
}
