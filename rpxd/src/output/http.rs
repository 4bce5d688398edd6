use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::{HttpOutputConfig, OutputConfig};
use rpx_core::wire::{self, PayloadKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::client::{ClientSettings, HttpClient, HttpTarget};
use crate::plugins::{BuiltOutput, Sink, Source};

/// How long a worker waits on an empty queue before counting itself idle.
const IDLE_POLL: Duration = Duration::from_millis(100);
const DRAIN_POLL: Duration = Duration::from_millis(10);

pub(crate) fn build(cfg: &OutputConfig) -> Result<BuiltOutput> {
    let url = cfg
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("http output requires url"))?;
    let target = HttpTarget::parse(url)?;
    let (pool, responses) = HttpOutput::start(cfg.display_name(), target, &cfg.http)
        .context("failed to start http worker pool")?;
    Ok(BuiltOutput {
        sink: Arc::new(pool),
        source: responses.map(|r| Box::new(r) as Box<dyn Source>),
    })
}

#[derive(Debug, Clone, Copy)]
struct PoolSettings {
    fixed: Option<usize>,
    max_workers: usize,
    idle_timeout: Duration,
    client: ClientSettings,
}

struct PoolShared {
    name: String,
    target: HttpTarget,
    settings: PoolSettings,
    queue: Mutex<mpsc::Receiver<Bytes>>,
    active: AtomicUsize,
    /// Records accepted by `write` and not yet replayed.
    pending: AtomicUsize,
    /// Taken by `close`, which ends the `ReplayedResponses` source.
    responses: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl PoolShared {
    fn set_workers_gauge(&self) {
        metrics::gauge!("rpx_http_workers", "output" => self.name.clone())
            .set(self.active.load(Ordering::Relaxed) as f64);
    }

    fn response_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        match self.responses.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn close_responses(&self) {
        let sender = match self.responses.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_some() {
            debug!(output = %self.name, "replayed response stream closed");
        }
    }

    /// Leaves at least one live worker behind.
    fn try_retire(&self) -> bool {
        let retired = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok();
        if retired {
            self.set_workers_gauge();
        }
        retired
    }

    async fn replay(&self, client: &mut HttpClient, record: Bytes) {
        let uuid = wire::parse_header(&record).ok().map(|meta| meta.uuid);
        let request = wire::payload_body(&record);
        let started = Instant::now();
        match client.send(&request).await {
            Ok(response) => {
                metrics::counter!("rpx_http_requests_total", "output" => self.name.clone())
                    .increment(1);
                debug!(output = %self.name, status = response.status, "request replayed");
                let (Some(tx), Some(uuid)) = (self.response_sender(), uuid) else {
                    return;
                };
                let rtt = started.elapsed().as_nanos() as i64;
                let record =
                    wire::encode_record(PayloadKind::ReplayedResponse, &uuid, rtt, &response.raw);
                if tx.try_send(record).is_err() {
                    debug!(output = %self.name, "replayed response queue full; response dropped");
                }
            }
            Err(err) => {
                metrics::counter!("rpx_http_errors_total", "output" => self.name.clone())
                    .increment(1);
                warn!(error = %err, output = %self.name, "replay failed");
                if err.is_connection_fatal() && client.is_connected() {
                    client.reset();
                }
            }
        }
    }
}

/// Elastic pool of replay workers behind a bounded queue.
///
/// `write` blocks while the queue is full. Without a fixed `http.workers`
/// the pool starts with one worker, grows when the queue is deeper than the
/// live worker count and shrinks back after `idle_timeout` without work.
pub(crate) struct HttpOutput {
    shared: Arc<PoolShared>,
    queue: mpsc::Sender<Bytes>,
    scale: Option<mpsc::UnboundedSender<usize>>,
}

impl HttpOutput {
    pub(crate) fn start(
        name: String,
        target: HttpTarget,
        cfg: &HttpOutputConfig,
    ) -> Result<(Self, Option<ReplayedResponses>)> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("http output must be created inside the runtime")?;
        let settings = PoolSettings {
            fixed: cfg.workers,
            max_workers: cfg.max_workers.max(1),
            idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
            client: ClientSettings {
                timeout: Duration::from_millis(cfg.timeout_ms),
                original_host: cfg.original_host,
                response_buffer_bytes: cfg.response_buffer_bytes,
                follow_redirects: cfg.follow_redirects,
            },
        };
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_size.max(1));
        let (responses, replayed) = if cfg.track_responses {
            let (tx, rx) = mpsc::channel(cfg.queue_size.max(1));
            let source = ReplayedResponses {
                name: format!("{name} responses"),
                rx,
            };
            (Some(tx), Some(source))
        } else {
            (None, None)
        };
        let shared = Arc::new(PoolShared {
            name,
            target,
            settings,
            queue: Mutex::new(queue_rx),
            active: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            responses: std::sync::Mutex::new(responses),
        });

        let initial = settings.fixed.unwrap_or(1);
        for _ in 0..initial {
            spawn_worker(&runtime, shared.clone());
        }
        let scale = if settings.fixed.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            runtime.spawn(scale_loop(shared.clone(), rx));
            Some(tx)
        } else {
            None
        };
        info!(
            output = %shared.name,
            target = %shared.target.addr,
            workers = initial,
            elastic = scale.is_some(),
            "http worker pool started"
        );
        Ok((
            Self {
                shared,
                queue: queue_tx,
                scale,
            },
            replayed,
        ))
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }
}

#[async_trait]
impl Sink for HttpOutput {
    async fn write(&self, payload: Bytes) -> Result<usize> {
        if !wire::is_request(&payload) {
            return Ok(0);
        }
        let len = payload.len();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(payload).await.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(anyhow!("http output {} is shut down", self.shared.name));
        }
        let depth = self.queue_depth();
        metrics::gauge!("rpx_http_queue_depth", "output" => self.shared.name.clone())
            .set(depth as f64);
        if let Some(scale) = self.scale.as_ref() {
            let active = self.active_workers();
            if depth > active {
                let _ = scale.send(depth - active);
            }
        }
        Ok(len)
    }

    /// Waits for queued requests, then ends the replayed response stream.
    async fn close(&self) {
        self.drain().await;
        self.shared.close_responses();
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl HttpOutput {
    /// Gives up once no request completed for a full client timeout.
    async fn drain(&self) {
        let stall = self.shared.settings.client.timeout;
        let mut last = self.shared.pending.load(Ordering::Acquire);
        let mut deadline = Instant::now() + stall;
        while last > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
            let now = self.shared.pending.load(Ordering::Acquire);
            if now < last {
                deadline = Instant::now() + stall;
            } else if Instant::now() >= deadline {
                warn!(
                    output = %self.shared.name,
                    pending = now,
                    "http output closed with requests in flight"
                );
                return;
            }
            last = now;
        }
        debug!(output = %self.shared.name, "http output drained");
    }
}

fn spawn_worker(runtime: &tokio::runtime::Handle, shared: Arc<PoolShared>) {
    shared.active.fetch_add(1, Ordering::AcqRel);
    shared.set_workers_gauge();
    runtime.spawn(worker(shared));
}

async fn scale_loop(shared: Arc<PoolShared>, mut requests: mpsc::UnboundedReceiver<usize>) {
    let runtime = tokio::runtime::Handle::current();
    while let Some(missing) = requests.recv().await {
        let active = shared.active.load(Ordering::Acquire);
        let room = shared.settings.max_workers.saturating_sub(active);
        let spawn = missing.min(room);
        if spawn == 0 {
            continue;
        }
        debug!(output = %shared.name, active, spawn, "scaling http worker pool up");
        for _ in 0..spawn {
            spawn_worker(&runtime, shared.clone());
        }
    }
}

async fn worker(shared: Arc<PoolShared>) {
    let mut client = HttpClient::new(shared.target.clone(), shared.settings.client);
    let elastic = shared.settings.fixed.is_none();
    let mut idle_since: Option<Instant> = None;
    loop {
        let next = timeout(IDLE_POLL, async { shared.queue.lock().await.recv().await }).await;
        match next {
            Ok(Some(record)) => {
                idle_since = None;
                shared.replay(&mut client, record).await;
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(None) => break,
            Err(_) => {
                if !elastic {
                    continue;
                }
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= shared.settings.idle_timeout && shared.try_retire() {
                    debug!(output = %shared.name, "idle http worker retired");
                    return;
                }
            }
        }
    }
    shared.active.fetch_sub(1, Ordering::AcqRel);
    shared.set_workers_gauge();
}

/// Replayed responses of a pool with `track_responses`, as type 3 records.
pub(crate) struct ReplayedResponses {
    name: String,
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl Source for ReplayedResponses {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
