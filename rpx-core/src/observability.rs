use crate::config::{LoggingConfig, MetricsConfig};
use anyhow::{anyhow, Context, Result};
use cidr::IpCidr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing_subscriber::EnvFilter;

const MAX_METRICS_REQUEST_BYTES: usize = 16 * 1024;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs the global tracing subscriber. `RUST_LOG` overrides
/// `logging.level` when set.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    let base = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);
    let layer = match cfg.format.to_ascii_lowercase().as_str() {
        "pretty" => base.pretty().with_filter(filter).boxed(),
        "compact" => base.compact().with_filter(filter).boxed(),
        _ => base
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow!("logging init failed: {e}"))
}

/// Installs the prometheus recorder and serves it on `metrics.listen`.
pub fn start_metrics(config: &MetricsConfig) -> Result<()> {
    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid metrics.listen {}", config.listen))?;
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    let allow: Vec<IpCidr> = config
        .allow
        .iter()
        .map(|cidr| cidr.parse())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("invalid metrics.allow CIDR"))?;
    let endpoint = Arc::new(MetricsEndpoint { path, allow });
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_connections.max(1)));

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow!("metrics recorder install failed: {}", e))?;

    let runtime = tokio::runtime::Handle::try_current()
        .context("metrics endpoint requires running Tokio runtime")?;
    runtime.spawn(async move {
        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = ?err, %listen, "failed to bind metrics listener");
                return;
            }
        };
        tracing::info!(%listen, "metrics endpoint listening");
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = ?err, "metrics accept failed");
                    continue;
                }
            };
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                let _ = timeout(
                    Duration::from_secs(1),
                    write_plain(&mut stream, "503 Service Unavailable", "busy"),
                )
                .await;
                continue;
            };
            let endpoint = endpoint.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let _permit = permit;
                endpoint.serve(stream, peer.ip(), &handle).await;
            });
        }
    });
    Ok(())
}

struct MetricsEndpoint {
    path: String,
    allow: Vec<IpCidr>,
}

impl MetricsEndpoint {
    fn allows(&self, peer: IpAddr) -> bool {
        peer.is_loopback() || self.allow.iter().any(|cidr| cidr.contains(&peer))
    }

    async fn serve(&self, mut stream: TcpStream, peer: IpAddr, handle: &PrometheusHandle) {
        if !self.allows(peer) {
            let _ = write_plain(&mut stream, "403 Forbidden", "forbidden").await;
            return;
        }
        let request_path =
            match timeout(METRICS_READ_TIMEOUT, read_request_path(&mut stream)).await {
                Ok(Ok(Some(path))) => path,
                Ok(Ok(None)) => return,
                Ok(Err(_)) | Err(_) => {
                    let _ = write_plain(&mut stream, "400 Bad Request", "bad request").await;
                    return;
                }
            };
        if request_path == "/health" {
            let _ = write_plain(&mut stream, "200 OK", "OK").await;
        } else if request_path == self.path {
            let body = handle.render();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        } else {
            let _ = write_plain(&mut stream, "404 Not Found", "not found").await;
        }
    }
}

async fn write_plain(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn read_request_path(stream: &mut TcpStream) -> Result<Option<String>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.len().saturating_add(n) > MAX_METRICS_REQUEST_BYTES {
            return Err(anyhow!("metrics request header too large"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = crate::proto::headers_end(&buf) {
            return parse_request_path(&buf[..end]).map(Some);
        }
    }
}

fn parse_request_path(head: &[u8]) -> Result<String> {
    let head =
        std::str::from_utf8(head).map_err(|_| anyhow!("metrics request is not valid utf-8"))?;
    let first = head.lines().next().unwrap_or_default();
    let mut parts = first.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some(path), Some(version)) if version.starts_with("HTTP/1.") => {
            Ok(path.to_string())
        }
        (Some(_), Some(_), Some(_)) => Err(anyhow!("unsupported metrics request")),
        _ => Err(anyhow!("malformed request line")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_line() {
        let path = parse_request_path(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n").expect("path");
        assert_eq!(path, "/metrics");
    }

    #[test]
    fn rejects_other_methods() {
        assert!(parse_request_path(b"POST /metrics HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request_path(b"GET /metrics\r\n\r\n").is_err());
    }

    #[test]
    fn loopback_is_always_allowed() {
        let endpoint = MetricsEndpoint {
            path: "/metrics".into(),
            allow: vec!["10.0.0.0/8".parse().expect("cidr")],
        };
        assert!(endpoint.allows("127.0.0.1".parse().expect("ip")));
        assert!(endpoint.allows("10.1.2.3".parse().expect("ip")));
        assert!(!endpoint.allows("192.168.1.1".parse().expect("ip")));
    }
}
