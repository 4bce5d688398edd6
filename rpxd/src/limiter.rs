use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::LimitSpec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::plugins::{Sink, Source};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    started: Instant,
    seen: u64,
    passed: u64,
}

/// Per-second admission counter shared by [`LimitedSink`] and
/// [`LimitedSource`].
///
/// Percentage limits are decided by position inside the window: the event
/// passes while the passed share stays below the configured one. `100%`
/// admits everything and `0%` nothing.
#[derive(Debug)]
pub(crate) struct Limiter {
    limit: LimitSpec,
    window: Mutex<Window>,
}

impl Limiter {
    pub(crate) fn new(limit: LimitSpec) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                seen: 0,
                passed: 0,
            }),
        }
    }

    pub(crate) fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if now.saturating_duration_since(window.started) >= WINDOW {
            *window = Window {
                started: now,
                seen: 0,
                passed: 0,
            };
        }
        window.seen += 1;
        let pass = match self.limit {
            LimitSpec::Absolute(max) => window.passed < max,
            LimitSpec::Percent(pct) => window.passed * 100 < u64::from(pct) * window.seen,
        };
        if pass {
            window.passed += 1;
        }
        pass
    }
}

/// Sheds writes over the limit. A shed write still reports success.
pub(crate) struct LimitedSink {
    inner: Arc<dyn Sink>,
    limiter: Limiter,
    name: String,
}

impl LimitedSink {
    pub(crate) fn new(inner: Arc<dyn Sink>, limit: LimitSpec) -> Self {
        let name = format!("{} (limit {})", inner.name(), describe(limit));
        Self {
            inner,
            limiter: Limiter::new(limit),
            name,
        }
    }
}

#[async_trait]
impl Sink for LimitedSink {
    async fn write(&self, payload: Bytes) -> Result<usize> {
        if !self.limiter.allow() {
            metrics::counter!("rpx_limiter_shed_total", "side" => "output").increment(1);
            trace!(output = %self.name, "write shed by limiter");
            return Ok(payload.len());
        }
        self.inner.write(payload).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Drops records read over the limit and keeps reading.
pub(crate) struct LimitedSource {
    inner: Box<dyn Source>,
    limiter: Limiter,
    name: String,
}

impl LimitedSource {
    pub(crate) fn new(inner: Box<dyn Source>, limit: LimitSpec) -> Self {
        let name = format!("{} (limit {})", inner.name(), describe(limit));
        Self {
            inner,
            limiter: Limiter::new(limit),
            name,
        }
    }
}

#[async_trait]
impl Source for LimitedSource {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        loop {
            let Some(record) = self.inner.read().await? else {
                return Ok(None);
            };
            if self.limiter.allow() {
                return Ok(Some(record));
            }
            metrics::counter!("rpx_limiter_shed_total", "side" => "input").increment(1);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn describe(limit: LimitSpec) -> String {
    match limit {
        LimitSpec::Absolute(n) => format!("{n}/s"),
        LimitSpec::Percent(pct) => format!("{pct}%"),
    }
}
