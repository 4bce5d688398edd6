use anyhow::{anyhow, Context, Result};
use cidr::IpCidr;
use regex::Regex;
use std::net::SocketAddr;

use super::types::*;

const MAX_FOLLOW_REDIRECTS: usize = 10;

/// Throughput cap attached to an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSpec {
    /// At most this many events per one-second window.
    Absolute(u64),
    /// This share (0-100) of events in each window.
    Percent(u32),
}

/// Parses `"10"` into an absolute limit and `"10%"` into a percentage.
pub fn parse_limit(raw: &str) -> Result<LimitSpec> {
    let raw = raw.trim();
    if let Some(pct) = raw.strip_suffix('%') {
        let pct: u32 = pct
            .trim()
            .parse()
            .map_err(|_| anyhow!("limit percentage must be an integer, got {raw:?}"))?;
        if pct > 100 {
            return Err(anyhow!("limit percentage must be within 0..=100, got {pct}"));
        }
        return Ok(LimitSpec::Percent(pct));
    }
    let n: u64 = raw
        .parse()
        .map_err(|_| anyhow!("limit must be \"N\" or \"N%\", got {raw:?}"))?;
    Ok(LimitSpec::Absolute(n))
}

/// Splits a `Name: value` rule at the first colon.
pub fn parse_header_rule(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("rule {raw:?} must look like \"Name: value\""))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("rule {raw:?} has an empty name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub(super) fn validate_config(config: &Config) -> Result<()> {
    if config.version != 1 {
        return Err(anyhow!(
            "unsupported config.version {} (expected 1)",
            config.version
        ));
    }
    if config.inputs.is_empty() {
        return Err(anyhow!("at least one input must be configured"));
    }
    if config.outputs.is_empty() {
        return Err(anyhow!("at least one output must be configured"));
    }
    validate_logging_config(&config.logging)?;
    if let Some(metrics) = config.metrics.as_ref() {
        validate_metrics_config(metrics)?;
    }
    validate_runtime_config(&config.runtime)?;
    for (idx, input) in config.inputs.iter().enumerate() {
        validate_input_config(input).with_context(|| format!("inputs[{idx}]"))?;
    }
    for (idx, output) in config.outputs.iter().enumerate() {
        validate_output_config(output).with_context(|| format!("outputs[{idx}]"))?;
    }
    if let Some(modifier) = config.modifier.as_ref() {
        validate_modifier_config(modifier)?;
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> Result<()> {
    if logging.level.trim().is_empty() {
        return Err(anyhow!("logging.level must not be empty"));
    }
    match logging.format.to_ascii_lowercase().as_str() {
        "json" | "pretty" | "compact" => Ok(()),
        other => Err(anyhow!(
            "logging.format must be json, pretty or compact (got {other})"
        )),
    }
}

fn validate_metrics_config(metrics: &MetricsConfig) -> Result<()> {
    metrics
        .listen
        .parse::<SocketAddr>()
        .map_err(|_| anyhow!("metrics.listen must be a socket address"))?;
    for cidr in &metrics.allow {
        cidr.parse::<IpCidr>()
            .map_err(|_| anyhow!("metrics.allow contains invalid CIDR {cidr}"))?;
    }
    if metrics.max_concurrent_connections == 0 {
        return Err(anyhow!("metrics.max_concurrent_connections must be >= 1"));
    }
    Ok(())
}

fn validate_runtime_config(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.worker_threads == Some(0) {
        return Err(anyhow!("runtime.worker_threads must be >= 1"));
    }
    if runtime.max_blocking_threads == Some(0) {
        return Err(anyhow!("runtime.max_blocking_threads must be >= 1"));
    }
    Ok(())
}

fn validate_input_config(input: &InputConfig) -> Result<()> {
    if let Some(limit) = input.limit.as_deref() {
        parse_limit(limit)?;
    }
    match input.kind {
        InputKind::Raw => {
            let address = require(input.address.as_deref(), "raw input requires address")?;
            capture_port(address)?;
            if input.capture.expire_ms == 0 {
                return Err(anyhow!("capture.expire_ms must be >= 1"));
            }
            if input.capture.snaplen < 64 {
                return Err(anyhow!("capture.snaplen must be >= 64"));
            }
            if input.capture.engine == CaptureEngine::PcapFile {
                require(input.path.as_deref(), "pcap_file engine requires path")?;
            }
        }
        InputKind::File => {
            require(input.path.as_deref(), "file input requires path")?;
        }
        InputKind::Tcp => {
            let address = require(input.address.as_deref(), "tcp input requires address")?;
            address
                .parse::<SocketAddr>()
                .map_err(|_| anyhow!("tcp input address must be a socket address"))?;
        }
        InputKind::Http => {
            let address = require(input.address.as_deref(), "http input requires address")?;
            address
                .parse::<SocketAddr>()
                .map_err(|_| anyhow!("http input address must be a socket address"))?;
        }
        InputKind::Dummy => {}
    }
    Ok(())
}

/// Port part of a raw capture address (`host:port` or `:port`).
pub fn capture_port(address: &str) -> Result<u16> {
    let (_, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("capture address {address:?} must be host:port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("capture address {address:?} has an invalid port"))?;
    if port == 0 {
        return Err(anyhow!("capture address {address:?} must use a non-zero port"));
    }
    Ok(port)
}

fn validate_output_config(output: &OutputConfig) -> Result<()> {
    if let Some(limit) = output.limit.as_deref() {
        parse_limit(limit)?;
    }
    match output.kind {
        OutputKind::Http => {
            let raw = require(output.url.as_deref(), "http output requires url")?;
            let url = url::Url::parse(raw).with_context(|| format!("invalid http url {raw}"))?;
            if url.scheme() != "http" {
                return Err(anyhow!("http output url must use the http scheme"));
            }
            if url.host_str().is_none() {
                return Err(anyhow!("http output url must include a host"));
            }
            validate_http_output(&output.http)?;
        }
        OutputKind::Tcp => {
            require(output.address.as_deref(), "tcp output requires address")?;
        }
        OutputKind::File => {
            require(output.path.as_deref(), "file output requires path")?;
        }
        OutputKind::Dummy => {}
    }
    Ok(())
}

fn validate_http_output(http: &HttpOutputConfig) -> Result<()> {
    if http.workers == Some(0) {
        return Err(anyhow!("http.workers must be >= 1 when set"));
    }
    if http.max_workers == 0 {
        return Err(anyhow!("http.max_workers must be >= 1"));
    }
    if let Some(workers) = http.workers {
        if workers > http.max_workers {
            return Err(anyhow!("http.workers must not exceed http.max_workers"));
        }
    }
    if http.queue_size == 0 {
        return Err(anyhow!("http.queue_size must be >= 1"));
    }
    if http.timeout_ms == 0 {
        return Err(anyhow!("http.timeout_ms must be >= 1"));
    }
    if http.idle_timeout_ms == 0 {
        return Err(anyhow!("http.idle_timeout_ms must be >= 1"));
    }
    if http.response_buffer_bytes == 0 {
        return Err(anyhow!("http.response_buffer_bytes must be >= 1"));
    }
    if http.follow_redirects > MAX_FOLLOW_REDIRECTS {
        return Err(anyhow!(
            "http.follow_redirects must be <= {MAX_FOLLOW_REDIRECTS}"
        ));
    }
    Ok(())
}

fn validate_modifier_config(modifier: &ModifierConfig) -> Result<()> {
    for method in &modifier.methods {
        if method.trim().is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(anyhow!("modifier.methods contains invalid method {method:?}"));
        }
    }
    for pattern in modifier
        .url_regexp
        .iter()
        .chain(modifier.url_negative_regexp.iter())
    {
        Regex::new(pattern).with_context(|| format!("modifier url regexp {pattern:?}"))?;
    }
    for rule in modifier
        .header_filters
        .iter()
        .chain(modifier.header_negative_filters.iter())
    {
        let (_, pattern) = parse_header_rule(rule)?;
        Regex::new(&pattern).with_context(|| format!("modifier header filter {rule:?}"))?;
    }
    for rule in modifier
        .header_hash_filters
        .iter()
        .chain(modifier.param_hash_filters.iter())
    {
        let (_, pct) = parse_header_rule(rule)?;
        match parse_limit(&pct)? {
            LimitSpec::Percent(_) => {}
            LimitSpec::Absolute(_) => {
                return Err(anyhow!("hash filter {rule:?} must end with a percentage"))
            }
        }
    }
    for rule in &modifier.url_rewrite {
        let (pattern, _) = rule
            .split_once(':')
            .ok_or_else(|| anyhow!("modifier.url_rewrite {rule:?} must be pattern:replacement"))?;
        Regex::new(pattern).with_context(|| format!("modifier url rewrite {rule:?}"))?;
    }
    for rule in modifier.headers.iter().chain(modifier.params.iter()) {
        parse_header_rule(rule)?;
    }
    Ok(())
}

fn require<'a>(value: Option<&'a str>, message: &'static str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(anyhow!(message)),
    }
}
