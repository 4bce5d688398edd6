use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::OutputConfig;
use rpx_core::wire::PAYLOAD_SEPARATOR;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::plugins::{BuiltOutput, Sink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn build(cfg: &OutputConfig) -> Result<BuiltOutput> {
    let address = cfg
        .address
        .as_deref()
        .ok_or_else(|| anyhow!("tcp output requires address"))?;
    Ok(BuiltOutput::sink(Arc::new(TcpOutput::new(
        cfg.display_name(),
        address.to_string(),
    ))))
}

/// Forwards separator-framed records to another rpxd over one connection,
/// reconnecting on the next write after a failure.
pub(crate) struct TcpOutput {
    name: String,
    address: String,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpOutput {
    pub(crate) fn new(name: String, address: String) -> Self {
        Self {
            name,
            address,
            stream: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", self.address))?
            .with_context(|| format!("connect to {} failed", self.address))?;
        let _ = stream.set_nodelay(true);
        debug!(output = %self.name, address = %self.address, "tcp output connected");
        Ok(stream)
    }
}

#[async_trait]
impl Sink for TcpOutput {
    async fn write(&self, payload: Bytes) -> Result<usize> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(anyhow!("tcp output {} has no connection", self.name));
        };
        let written = async {
            stream.write_all(&payload).await?;
            stream.write_all(PAYLOAD_SEPARATOR).await
        }
        .await;
        if let Err(err) = written {
            warn!(error = %err, output = %self.name, "tcp output connection lost");
            *guard = None;
            return Err(err).with_context(|| format!("write to {} failed", self.address));
        }
        Ok(payload.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpx_core::wire::RecordScanner;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn records_arrive_framed_on_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let out = TcpOutput::new("tcp".into(), addr);
        out.write(Bytes::from_static(b"1 a 1\nGET /a")).await.expect("write");
        out.write(Bytes::from_static(b"1 b 2\nGET /b")).await.expect("write");

        let (mut conn, _) = listener.accept().await.expect("accept");
        let mut scanner = RecordScanner::new();
        let mut got = Vec::new();
        let mut buf = [0u8; 256];
        while got.len() < 2 {
            let n = conn.read(&mut buf).await.expect("read");
            assert!(n > 0, "connection closed early");
            scanner.push(&buf[..n]);
            got.extend(std::iter::from_fn(|| scanner.next_record()));
        }
        assert_eq!(&got[0][..], b"1 a 1\nGET /a");
        assert_eq!(&got[1][..], b"1 b 2\nGET /b");
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_write_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let out = TcpOutput::new("tcp".into(), addr);
        assert!(out.write(Bytes::from_static(b"1 a 1\nGET /")).await.is_err());
        assert!(out.stream.lock().await.is_none());
    }
}
