pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "json".to_string()
}

pub(super) fn default_metrics_path() -> String {
    "/metrics".to_string()
}

pub(super) fn default_metrics_max_concurrent_connections() -> usize {
    64
}

pub(super) fn default_capture_expire_ms() -> u64 {
    2_000
}

pub(super) fn default_capture_snaplen() -> usize {
    65_536
}

pub(super) fn default_replay_speed() -> u32 {
    100
}

pub(super) fn default_http_max_workers() -> usize {
    512
}

pub(super) fn default_http_queue_size() -> usize {
    1_000
}

pub(super) fn default_http_timeout_ms() -> u64 {
    5_000
}

pub(super) fn default_http_idle_timeout_ms() -> u64 {
    2_000
}

pub(super) fn default_http_response_buffer_bytes() -> usize {
    64 * 1024
}
