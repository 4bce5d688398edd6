use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::{capture_port, CaptureEngine, InputConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::trace;

use crate::capture::{CaptureListener, CaptureSettings, PcapFileSource, RawSocketSource};
use crate::plugins::Source;

pub(crate) fn build(cfg: &InputConfig) -> Result<Box<dyn Source>> {
    let address = cfg
        .address
        .as_deref()
        .ok_or_else(|| anyhow!("raw input requires address"))?;
    let settings = CaptureSettings {
        port: capture_port(address)?,
        expire: Duration::from_millis(cfg.capture.expire_ms),
        track_response: cfg.capture.track_response,
        fast_completion: cfg.capture.fast_completion,
    };
    let mut listener = CaptureListener::start(settings);
    match cfg.capture.engine {
        CaptureEngine::RawSocket => {
            let host = capture_host(address)?;
            let source = RawSocketSource::open(host, cfg.capture.snaplen)?;
            listener.attach(Box::new(source))?;
        }
        CaptureEngine::PcapFile => {
            let path = cfg
                .path
                .as_deref()
                .ok_or_else(|| anyhow!("pcap_file engine requires path"))?;
            listener.attach(Box::new(PcapFileSource::open(PathBuf::from(path))?))?;
            listener.seal();
        }
    }
    Ok(Box::new(RawInput::new(cfg.display_name(), listener)))
}

/// Host part of `host:port`; an empty host captures on every interface.
fn capture_host(address: &str) -> Result<IpAddr> {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']');
    if host.is_empty() {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    host.parse()
        .with_context(|| format!("capture address {address:?} must use an ip host"))
}

/// Frames completed capture messages as wire records.
pub(crate) struct RawInput {
    name: String,
    listener: CaptureListener,
}

impl RawInput {
    pub(crate) fn new(name: String, listener: CaptureListener) -> Self {
        Self { name, listener }
    }
}

#[async_trait]
impl Source for RawInput {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let Some(message) = self.listener.receive().await else {
            return Ok(None);
        };
        trace!(
            input = %self.name,
            incoming = message.is_incoming,
            bytes = message.size(),
            "captured message"
        );
        Ok(Some(message.to_record()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
