//! Copy loops from every input to the outputs.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use rpx_core::config::FanoutPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::modifier::Modifier;
use crate::plugins::{Sink, Source};

/// Shared routing state of all copy loops.
struct Router {
    fanout: FanoutPolicy,
    modifiers: Vec<Arc<dyn Modifier>>,
    outputs: Vec<Arc<dyn Sink>>,
    next: AtomicUsize,
}

impl Router {
    fn apply(&self, mut payload: Bytes) -> Option<Bytes> {
        for modifier in &self.modifiers {
            payload = modifier.transform(payload);
            if payload.is_empty() {
                return None;
            }
        }
        Some(payload)
    }

    async fn route(&self, input: &str, payload: Bytes) {
        let Some(payload) = self.apply(payload) else {
            metrics::counter!("rpx_emitter_dropped_total", "input" => input.to_string())
                .increment(1);
            return;
        };
        metrics::counter!("rpx_emitter_messages_total", "input" => input.to_string()).increment(1);
        match self.fanout {
            FanoutPolicy::Broadcast => {
                for output in &self.outputs {
                    deliver(output.as_ref(), payload.clone()).await;
                }
            }
            FanoutPolicy::RoundRobin => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.outputs.len();
                deliver(self.outputs[idx].as_ref(), payload).await;
            }
        }
    }
}

async fn deliver(output: &dyn Sink, payload: Bytes) {
    if let Err(err) = output.write(payload).await {
        metrics::counter!("rpx_emitter_write_errors_total", "output" => output.name().to_string())
            .increment(1);
        warn!(error = ?err, output = %output.name(), "output write failed");
    }
}

type CopyLoops = JoinSet<(String, Result<()>)>;

/// Drives one copy loop per input until the inputs are exhausted or `quit`
/// flips to `true`.
///
/// Sources fed by an output (replayed responses) are `derived`: they only
/// end once their output is closed, so they are joined after the outputs
/// close instead of holding the shutdown open.
pub(crate) struct Emitter {
    router: Arc<Router>,
}

impl Emitter {
    pub(crate) fn new(
        fanout: FanoutPolicy,
        modifiers: Vec<Arc<dyn Modifier>>,
        outputs: Vec<Arc<dyn Sink>>,
    ) -> Result<Self> {
        if outputs.is_empty() {
            return Err(anyhow!("emitter needs at least one output"));
        }
        Ok(Self {
            router: Arc::new(Router {
                fanout,
                modifiers,
                outputs,
                next: AtomicUsize::new(0),
            }),
        })
    }

    pub(crate) async fn run(
        self,
        inputs: Vec<Box<dyn Source>>,
        derived: Vec<Box<dyn Source>>,
        quit: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut loops = self.spawn_loops(inputs, &quit);
        let mut derived_loops = self.spawn_loops(derived, &quit);
        info!(
            outputs = self.router.outputs.len(),
            derived = derived_loops.len(),
            fanout = ?self.router.fanout,
            "emitter started"
        );

        let mut failed = None;
        join_loops(&mut loops, &mut failed).await?;
        for output in &self.router.outputs {
            output.close().await;
        }
        join_loops(&mut derived_loops, &mut failed).await?;
        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_loops(
        &self,
        inputs: Vec<Box<dyn Source>>,
        quit: &watch::Receiver<bool>,
    ) -> CopyLoops {
        let mut loops = JoinSet::new();
        for input in inputs {
            let router = self.router.clone();
            let quit = quit.clone();
            loops.spawn(async move {
                let label = input.name().to_string();
                (label, copy_loop(input, router, quit).await)
            });
        }
        loops
    }
}

/// Keeps the first input error in `failed`; a panicked loop aborts the rest.
async fn join_loops(loops: &mut CopyLoops, failed: &mut Option<anyhow::Error>) -> Result<()> {
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok((label, Ok(()))) => debug!(input = %label, "copy loop finished"),
            Ok((label, Err(err))) => {
                warn!(error = ?err, input = %label, "input failed");
                failed.get_or_insert(err.context(format!("input {label} failed")));
            }
            Err(err) => {
                loops.abort_all();
                return Err(anyhow!("copy loop join failed: {err}"));
            }
        }
    }
    Ok(())
}

async fn copy_loop(
    mut input: Box<dyn Source>,
    router: Arc<Router>,
    mut quit: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *quit.borrow() {
            return Ok(());
        }
        let next = tokio::select! {
            changed = quit.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
            next = input.read() => next?,
        };
        let Some(payload) = next else {
            info!(input = %input.name(), "input exhausted");
            return Ok(());
        };
        router.route(input.name(), payload).await;
    }
}
