use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::OutputConfig;
use rpx_core::wire::PAYLOAD_SEPARATOR;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::plugins::{BuiltOutput, Sink};

pub(crate) fn build(cfg: &OutputConfig) -> Result<BuiltOutput> {
    let path = cfg
        .path
        .as_deref()
        .ok_or_else(|| anyhow!("file output requires path"))?;
    let sink = FileOutput::open(cfg.display_name(), Path::new(path), cfg.append)?;
    Ok(BuiltOutput::sink(Arc::new(sink)))
}

/// Capture file writer: every record is followed by the separator.
pub(crate) struct FileOutput {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileOutput {
    pub(crate) fn open(name: String, path: &Path, append: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            file: Mutex::new(File::from_std(file)),
        })
    }
}

#[async_trait]
impl Sink for FileOutput {
    async fn write(&self, payload: Bytes) -> Result<usize> {
        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(&payload).await?;
            file.write_all(PAYLOAD_SEPARATOR).await?;
            file.flush().await
        }
        .await;
        written.with_context(|| format!("write to {} failed", self.path.display()))?;
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
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("rpx-file-output-{tag}-{nanos}.gor"))
    }

    async fn write_all(path: &Path, append: bool, records: &[&'static str]) {
        let out = FileOutput::open("file".into(), path, append).expect("open");
        for record in records {
            out.write(Bytes::from_static(record.as_bytes())).await.expect("write");
        }
    }

    fn read_records(path: &Path) -> Vec<Bytes> {
        let mut scanner = RecordScanner::new();
        scanner.push(&std::fs::read(path).expect("read"));
        std::iter::from_fn(|| scanner.next_record()).collect()
    }

    #[tokio::test]
    async fn records_are_separated_and_truncated_by_default() {
        let path = temp_file("truncate");
        write_all(&path, false, &["1 a 1\nGET /old", "1 b 2\nGET /old2"]).await;
        write_all(&path, false, &["1 c 3\nGET /new"]).await;
        assert_eq!(read_records(&path), vec![Bytes::from_static(b"1 c 3\nGET /new")]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn append_keeps_existing_records() {
        let path = temp_file("append");
        write_all(&path, false, &["1 a 1\nGET /a"]).await;
        write_all(&path, true, &["1 b 2\nGET /b"]).await;
        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(&records[1][..], b"1 b 2\nGET /b");
        let _ = std::fs::remove_file(&path);
    }
}
