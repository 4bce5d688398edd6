use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::InputConfig;
use rpx_core::wire::{self, PayloadKind, RecordScanner};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::plugins::Source;

const READ_CHUNK: usize = 64 * 1024;

pub(crate) fn build(cfg: &InputConfig) -> Result<Box<dyn Source>> {
    let path = cfg
        .path
        .as_deref()
        .ok_or_else(|| anyhow!("file input requires path"))?;
    let path = PathBuf::from(path);
    if !path.is_file() {
        return Err(anyhow!("capture file {} does not exist", path.display()));
    }
    Ok(Box::new(FileInput::new(
        cfg.display_name(),
        path,
        cfg.replay.speed,
        cfg.replay.loop_input,
    )))
}

struct Reader {
    file: File,
    scanner: RecordScanner,
}

#[derive(Debug, Clone, Copy)]
struct Pace {
    recorded: i64,
    emitted: Instant,
}

/// Replays a capture file, spacing requests as they were recorded.
///
/// `speed` is a percentage of the recorded pace (`200` replays twice as
/// fast); `0` replays without waiting.
pub(crate) struct FileInput {
    name: String,
    path: PathBuf,
    speed: u32,
    loop_input: bool,
    reader: Option<Reader>,
    records_this_pass: u64,
    finished: bool,
    pace: Option<Pace>,
}

impl FileInput {
    pub(crate) fn new(name: String, path: PathBuf, speed: u32, loop_input: bool) -> Self {
        Self {
            name,
            path,
            speed,
            loop_input,
            reader: None,
            records_this_pass: 0,
            finished: false,
            pace: None,
        }
    }

    async fn next_record(&mut self) -> Result<Option<Bytes>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.reader.is_none() {
                let file = File::open(&self.path)
                    .await
                    .with_context(|| format!("failed to open {}", self.path.display()))?;
                self.reader = Some(Reader {
                    file,
                    scanner: RecordScanner::new(),
                });
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };
            if let Some(record) = reader.scanner.next_record() {
                self.records_this_pass += 1;
                return Ok(Some(record));
            }
            let n = reader
                .file
                .read(&mut chunk)
                .await
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            if n > 0 {
                reader.scanner.push(&chunk[..n]);
                continue;
            }

            let rest = reader.scanner.finish();
            let produced = self.records_this_pass + u64::from(rest.is_some());
            self.reader = None;
            self.records_this_pass = 0;
            self.pace = None;
            if self.loop_input && produced > 0 {
                debug!(input = %self.name, records = produced, "capture file rewound");
            } else {
                info!(input = %self.name, "capture file exhausted");
                self.finished = true;
            }
            if rest.is_some() {
                return Ok(rest);
            }
        }
    }

    async fn pace(&mut self, record: &[u8]) {
        if self.speed == 0 {
            return;
        }
        let Ok(meta) = wire::parse_header(record) else {
            return;
        };
        if meta.kind != PayloadKind::Request {
            return;
        }
        if let Some(prev) = self.pace {
            let gap = meta.timing.saturating_sub(prev.recorded).max(0) as u128;
            let scaled = gap * 100 / u128::from(self.speed);
            let wait = Duration::from_nanos(u64::try_from(scaled).unwrap_or(u64::MAX));
            sleep_until(prev.emitted + wait).await;
        }
        self.pace = Some(Pace {
            recorded: meta.timing,
            emitted: Instant::now(),
        });
    }
}

#[async_trait]
impl Source for FileInput {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let Some(record) = self.next_record().await? else {
            return Ok(None);
        };
        self.pace(&record).await;
        Ok(Some(record))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpx_core::wire::PAYLOAD_SEPARATOR;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECOND: i64 = 1_000_000_000;

    fn capture_file(tag: &str, timings: &[i64], trailing_separator: bool) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rpx-file-input-{tag}-{nanos}.gor"));
        let mut data = Vec::new();
        for (i, timing) in timings.iter().enumerate() {
            if i > 0 {
                data.extend_from_slice(PAYLOAD_SEPARATOR);
            }
            let body = format!("GET /{i} HTTP/1.1\r\n\r\n");
            let uuid = wire::random_uuid();
            let record = wire::encode_record(PayloadKind::Request, &uuid, *timing, body.as_bytes());
            data.extend_from_slice(&record);
        }
        if trailing_separator {
            data.extend_from_slice(PAYLOAD_SEPARATOR);
        }
        std::fs::write(&path, data).expect("write capture");
        path
    }

    async fn read_all(input: &mut FileInput) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(record) = input.read().await.expect("read") {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn replays_every_record_once() {
        let path = capture_file("once", &[0, 1, 2], false);
        let mut input = FileInput::new("file".into(), path.clone(), 0, false);
        let records = read_all(&mut input).await;
        assert_eq!(records.len(), 3);
        assert!(wire::payload_body(&records[2]).starts_with(b"GET /2 "));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unpaced_replay_ignores_recorded_gaps() {
        let path = capture_file("fast", &[0, 30 * SECOND, 60 * SECOND], true);
        let mut input = FileInput::new("file".into(), path.clone(), 0, false);
        let started = Instant::now();
        assert_eq!(read_all(&mut input).await.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(5));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn recorded_gaps_are_scaled_by_speed() {
        let path = capture_file("paced", &[0, SECOND / 10, 3 * SECOND / 10], false);
        let mut input = FileInput::new("file".into(), path.clone(), 300, false);
        let started = Instant::now();
        assert_eq!(read_all(&mut input).await.len(), 3);
        // 300ms recorded, replayed at triple speed
        assert!(started.elapsed() >= Duration::from_millis(90));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn looping_rewinds_the_file() {
        let path = capture_file("loop", &[0, 1], false);
        let mut input = FileInput::new("file".into(), path.clone(), 0, true);
        let mut uris = Vec::new();
        for _ in 0..5 {
            let record = input.read().await.expect("read").expect("record");
            uris.push(wire::payload_body(&record).slice(..6));
        }
        assert_eq!(uris[0], uris[2]);
        assert_eq!(uris[1], uris[3]);
        assert_eq!(uris[0], uris[4]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn looping_an_empty_file_ends() {
        let path = capture_file("empty", &[], false);
        let mut input = FileInput::new("file".into(), path.clone(), 0, true);
        assert!(input.read().await.expect("read").is_none());
        let _ = std::fs::remove_file(&path);
    }
}
