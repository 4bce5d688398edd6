use serde::Deserialize;

use super::defaults::*;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub modifier: Option<ModifierConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    pub listen: String,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default = "default_metrics_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub max_blocking_threads: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FanoutPolicy {
    #[default]
    Broadcast,
    RoundRobin,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EmitterConfig {
    #[serde(default)]
    pub fanout: FanoutPolicy,
}

/// Filter and rewrite rules applied to every request record before fan-out.
///
/// Rule lists use the `Name: value` / `pattern:replacement` notation of the
/// command line tools this daemon grew out of; they are compiled once at
/// startup.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ModifierConfig {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub url_regexp: Vec<String>,
    #[serde(default)]
    pub url_negative_regexp: Vec<String>,
    #[serde(default)]
    pub header_filters: Vec<String>,
    #[serde(default)]
    pub header_negative_filters: Vec<String>,
    #[serde(default)]
    pub header_hash_filters: Vec<String>,
    #[serde(default)]
    pub param_hash_filters: Vec<String>,
    #[serde(default)]
    pub url_rewrite: Vec<String>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Raw,
    File,
    Tcp,
    Http,
    Dummy,
}

impl InputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::File => "file",
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Dummy => "dummy",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InputConfig {
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default)]
    pub name: Option<String>,
    /// `raw`: `host:port` to capture. `tcp` and `http`: listen address.
    #[serde(default)]
    pub address: Option<String>,
    /// `file`: capture file. `raw` with the pcap engine: pcap file.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub replay: FileReplayConfig,
}

impl InputConfig {
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref() {
            return name.to_string();
        }
        let target = self
            .address
            .as_deref()
            .or(self.path.as_deref())
            .unwrap_or_default();
        format!("{}:{}", self.kind.as_str(), target)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureEngine {
    #[default]
    RawSocket,
    PcapFile,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaptureConfig {
    #[serde(default)]
    pub engine: CaptureEngine,
    #[serde(default = "default_capture_expire_ms")]
    pub expire_ms: u64,
    #[serde(default)]
    pub track_response: bool,
    #[serde(default)]
    pub fast_completion: bool,
    #[serde(default = "default_capture_snaplen")]
    pub snaplen: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            engine: CaptureEngine::default(),
            expire_ms: default_capture_expire_ms(),
            track_response: false,
            fast_completion: false,
            snaplen: default_capture_snaplen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FileReplayConfig {
    /// Replay speed in percent of the recorded pace; 0 disables pacing.
    #[serde(default = "default_replay_speed")]
    pub speed: u32,
    #[serde(default, rename = "loop")]
    pub loop_input: bool,
}

impl Default for FileReplayConfig {
    fn default() -> Self {
        Self {
            speed: default_replay_speed(),
            loop_input: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Http,
    File,
    Tcp,
    Dummy,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::File => "file",
            Self::Tcp => "tcp",
            Self::Dummy => "dummy",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub append: bool,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub http: HttpOutputConfig,
}

impl OutputConfig {
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref() {
            return name.to_string();
        }
        let target = self
            .url
            .as_deref()
            .or(self.address.as_deref())
            .or(self.path.as_deref())
            .unwrap_or_default();
        format!("{}:{}", self.kind.as_str(), target)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HttpOutputConfig {
    /// Fixed pool size. When absent the pool scales with queue depth.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_http_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_http_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_http_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub original_host: bool,
    #[serde(default)]
    pub track_responses: bool,
    #[serde(default = "default_http_response_buffer_bytes")]
    pub response_buffer_bytes: usize,
    /// 3xx responses followed with a `GET` to their `Location`; 0 disables.
    #[serde(default)]
    pub follow_redirects: usize,
}

impl Default for HttpOutputConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_workers: default_http_max_workers(),
            queue_size: default_http_queue_size(),
            timeout_ms: default_http_timeout_ms(),
            idle_timeout_ms: default_http_idle_timeout_ms(),
            original_host: false,
            track_responses: false,
            response_buffer_bytes: default_http_response_buffer_bytes(),
            follow_redirects: 0,
        }
    }
}
