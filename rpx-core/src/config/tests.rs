use super::*;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fs, path::PathBuf};

fn unique_tmp_dir() -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    dir.push(format!("rpx-config-test-{}", nanos));
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

fn load_str(name: &str, yaml: &str) -> anyhow::Result<Config> {
    let dir = unique_tmp_dir();
    let path = dir.join(name);
    fs::write(&path, yaml).expect("write config");
    let result = load_config(&path);
    fs::remove_dir_all(&dir).ok();
    result
}

const MINIMAL: &str = r#"
version: 1
inputs:
  - type: raw
    address: ":8080"
outputs:
  - type: http
    url: "http://staging.internal:8080"
"#;

#[test]
fn minimal_config_gets_defaults() {
    let cfg = load_str("minimal.yaml", MINIMAL).expect("load");
    assert_eq!(cfg.logging.level, "info");
    assert_eq!(cfg.logging.format, "json");
    assert_eq!(cfg.emitter.fanout, FanoutPolicy::Broadcast);
    let input = &cfg.inputs[0];
    assert_eq!(input.kind, InputKind::Raw);
    assert_eq!(input.capture.engine, CaptureEngine::RawSocket);
    assert_eq!(input.capture.expire_ms, 2_000);
    assert!(!input.capture.fast_completion);
    let http = &cfg.outputs[0].http;
    assert_eq!(http.workers, None);
    assert_eq!(http.queue_size, 1_000);
    assert_eq!(http.idle_timeout_ms, 2_000);
    assert_eq!(cfg.outputs[0].display_name(), "http:http://staging.internal:8080");
}

#[test]
fn include_and_env_are_expanded() {
    let dir = unique_tmp_dir();
    let include = dir.join("outputs.yaml");
    let base = dir.join("base.yaml");
    fs::write(
        &include,
        r#"
outputs:
  - type: tcp
    address: "${RPX_TEST_REPLAY_ADDR}"
    limit: "25%"
"#,
    )
    .expect("write include");
    fs::write(
        &base,
        r#"
version: 1
include:
  - outputs.yaml
emitter:
  fanout: round_robin
inputs:
  - type: dummy
"#,
    )
    .expect("write base");

    std::env::set_var("RPX_TEST_REPLAY_ADDR", "10.0.0.2:28020");
    let loaded = load_config(&base).expect("load config");
    std::env::remove_var("RPX_TEST_REPLAY_ADDR");
    fs::remove_dir_all(&dir).ok();

    assert_eq!(loaded.emitter.fanout, FanoutPolicy::RoundRobin);
    assert_eq!(loaded.outputs.len(), 1);
    assert_eq!(loaded.outputs[0].address.as_deref(), Some("10.0.0.2:28020"));
    assert_eq!(loaded.outputs[0].limit.as_deref(), Some("25%"));
}

#[test]
fn later_files_override_earlier_ones() {
    let dir = unique_tmp_dir();
    let a = dir.join("a.yaml");
    let b = dir.join("b.yaml");
    fs::write(&a, MINIMAL).expect("write a");
    fs::write(&b, "logging:\n  level: debug\n").expect("write b");
    let loaded = load_configs(&[a, b]).expect("load");
    fs::remove_dir_all(&dir).ok();
    assert_eq!(loaded.logging.level, "debug");
    assert_eq!(loaded.inputs.len(), 1);
}

#[test]
fn unknown_keys_are_rejected() {
    let yaml = format!("{MINIMAL}\nemiter:\n  fanout: broadcast\n");
    let err = load_str("typo.yaml", &yaml).expect_err("must fail");
    assert!(err.to_string().contains("emiter"), "unexpected error: {err}");
}

#[test]
fn include_loop_is_detected() {
    let dir = unique_tmp_dir();
    let a = dir.join("a.yaml");
    fs::write(&a, "include:\n  - a.yaml\n").expect("write");
    let err = load_config(&a).expect_err("must fail");
    fs::remove_dir_all(&dir).ok();
    assert!(format!("{err:#}").contains("include loop"), "unexpected error: {err:#}");
}

#[test]
fn rejects_config_without_outputs() {
    let err = load_str(
        "no-outputs.yaml",
        "version: 1\ninputs:\n  - type: dummy\n",
    )
    .expect_err("must fail");
    assert!(
        err.to_string().contains("at least one output"),
        "unexpected error: {err}"
    );
}

#[test]
fn rejects_https_replay_target() {
    let yaml = MINIMAL.replace("http://staging", "https://staging");
    let err = load_str("https.yaml", &yaml).expect_err("must fail");
    assert!(
        format!("{err:#}").contains("http scheme"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn rejects_zero_fixed_workers() {
    let yaml = format!("{MINIMAL}    http:\n      workers: 0\n");
    let err = load_str("workers.yaml", &yaml).expect_err("must fail");
    assert!(
        format!("{err:#}").contains("http.workers must be >= 1"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn rejects_raw_input_without_port() {
    let yaml = MINIMAL.replace("\":8080\"", "\"localhost\"");
    let err = load_str("port.yaml", &yaml).expect_err("must fail");
    assert!(
        format!("{err:#}").contains("host:port"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn rejects_bad_modifier_regexp() {
    let yaml = format!("{MINIMAL}modifier:\n  url_regexp: [\"(unclosed\"]\n");
    let err = load_str("regexp.yaml", &yaml).expect_err("must fail");
    assert!(
        format!("{err:#}").contains("modifier url regexp"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn parses_limits() {
    assert_eq!(parse_limit("10").expect("abs"), LimitSpec::Absolute(10));
    assert_eq!(parse_limit(" 25% ").expect("pct"), LimitSpec::Percent(25));
    assert_eq!(parse_limit("0%").expect("zero"), LimitSpec::Percent(0));
    assert!(parse_limit("150%").is_err());
    assert!(parse_limit("ten").is_err());
}

#[test]
fn parses_header_rules() {
    let (name, value) = parse_header_rule("X-Shadow: on: yes").expect("rule");
    assert_eq!(name, "X-Shadow");
    assert_eq!(value, "on: yes");
    assert!(parse_header_rule(": nothing").is_err());
    assert!(parse_header_rule("no-colon").is_err());
}

#[test]
fn http_input_needs_a_listen_address() {
    let yaml = MINIMAL.replace("type: raw\n    address: \":8080\"", "type: http\n    address: \"127.0.0.1:28020\"");
    let cfg = load_str("http-input.yaml", &yaml).expect("load");
    assert_eq!(cfg.inputs[0].kind, InputKind::Http);
    assert_eq!(cfg.inputs[0].display_name(), "http:127.0.0.1:28020");

    let yaml = MINIMAL.replace("type: raw\n    address: \":8080\"", "type: http\n    address: \":8080\"");
    let err = load_str("http-input-bad.yaml", &yaml).expect_err("must fail");
    assert!(
        format!("{err:#}").contains("http input address"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn follow_redirects_is_bounded() {
    let cfg = load_str("redirects-default.yaml", MINIMAL).expect("load");
    assert_eq!(cfg.outputs[0].http.follow_redirects, 0);

    let yaml = format!("{MINIMAL}    http:\n      follow_redirects: 3\n");
    let cfg = load_str("redirects.yaml", &yaml).expect("load");
    assert_eq!(cfg.outputs[0].http.follow_redirects, 3);

    let yaml = format!("{MINIMAL}    http:\n      follow_redirects: 50\n");
    let err = load_str("redirects-many.yaml", &yaml).expect_err("must fail");
    assert!(
        format!("{err:#}").contains("http.follow_redirects"),
        "unexpected error: {err:#}"
    );
}
