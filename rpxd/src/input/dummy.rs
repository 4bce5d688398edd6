use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::InputConfig;
use rpx_core::wire::{self, PayloadKind};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::plugins::Source;

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\nUser-Agent: rpxd-dummy\r\n\r\n";

pub(crate) fn build(cfg: &InputConfig) -> Result<Box<dyn Source>> {
    Ok(Box::new(DummyInput::new(cfg.display_name(), Duration::from_secs(1))))
}

/// Emits a synthetic `GET /` request record on every tick.
pub(crate) struct DummyInput {
    name: String,
    ticks: Interval,
}

impl DummyInput {
    pub(crate) fn new(name: String, period: Duration) -> Self {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { name, ticks }
    }
}

#[async_trait]
impl Source for DummyInput {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        self.ticks.tick().await;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Ok(Some(wire::encode_record(
            PayloadKind::Request,
            &wire::random_uuid(),
            now,
            REQUEST,
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn one_request_per_period() {
        let mut input = DummyInput::new("dummy".into(), Duration::from_secs(1));
        let started = Instant::now();
        let first = input.read().await.expect("read").expect("record");
        let second = input.read().await.expect("read").expect("record");
        assert!(started.elapsed() >= Duration::from_secs(1));

        let a = wire::parse_header(&first).expect("meta");
        let b = wire::parse_header(&second).expect("meta");
        assert_eq!(a.kind, PayloadKind::Request);
        assert_ne!(a.uuid, b.uuid);
        assert_eq!(&first[a.body_offset..], REQUEST);
    }
}
