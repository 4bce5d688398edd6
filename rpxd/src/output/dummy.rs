use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::OutputConfig;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::plugins::{BuiltOutput, Sink};

pub(crate) fn build(cfg: &OutputConfig) -> Result<BuiltOutput> {
    Ok(BuiltOutput::sink(Arc::new(DummyOutput {
        name: cfg.display_name(),
        stdout: Mutex::new(tokio::io::stdout()),
    })))
}

/// Prints records to stdout, one per line.
pub(crate) struct DummyOutput {
    name: String,
    stdout: Mutex<Stdout>,
}

#[async_trait]
impl Sink for DummyOutput {
    async fn write(&self, payload: Bytes) -> Result<usize> {
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&payload).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(payload.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
