//! Request filtering and rewriting applied between inputs and outputs.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use regex::bytes::Regex;
use rpx_core::config::{parse_header_rule, parse_limit, LimitSpec, ModifierConfig};
use rpx_core::{proto, wire};
use tracing::debug;

/// Transformation hook of the emitter. An empty result drops the record.
pub(crate) trait Modifier: Send + Sync {
    fn transform(&self, payload: Bytes) -> Bytes;
}

struct HeaderFilter {
    name: String,
    regexp: Regex,
}

struct HashFilter {
    name: String,
    percent: u32,
}

struct Rewrite {
    pattern: Regex,
    replacement: Vec<u8>,
}

/// Compiled [`ModifierConfig`]. Only request records are inspected;
/// responses and non-HTTP payloads pass through untouched.
pub(crate) struct HttpModifier {
    methods: Vec<Vec<u8>>,
    url_regexp: Vec<Regex>,
    url_negative_regexp: Vec<Regex>,
    header_filters: Vec<HeaderFilter>,
    header_negative_filters: Vec<HeaderFilter>,
    header_hash_filters: Vec<HashFilter>,
    param_hash_filters: Vec<HashFilter>,
    url_rewrite: Vec<Rewrite>,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl HttpModifier {
    pub(crate) fn from_config(cfg: &ModifierConfig) -> Result<Self> {
        Ok(Self {
            methods: cfg
                .methods
                .iter()
                .map(|m| m.trim().to_ascii_uppercase().into_bytes())
                .collect(),
            url_regexp: compile_all(&cfg.url_regexp)?,
            url_negative_regexp: compile_all(&cfg.url_negative_regexp)?,
            header_filters: header_filters(&cfg.header_filters)?,
            header_negative_filters: header_filters(&cfg.header_negative_filters)?,
            header_hash_filters: hash_filters(&cfg.header_hash_filters)?,
            param_hash_filters: hash_filters(&cfg.param_hash_filters)?,
            url_rewrite: cfg
                .url_rewrite
                .iter()
                .map(|rule| {
                    let (pattern, replacement) = rule.split_once(':').ok_or_else(|| {
                        anyhow!("url rewrite {rule:?} must be pattern:replacement")
                    })?;
                    Ok(Rewrite {
                        pattern: Regex::new(pattern)
                            .with_context(|| format!("url rewrite {rule:?}"))?,
                        replacement: replacement.as_bytes().to_vec(),
                    })
                })
                .collect::<Result<_>>()?,
            params: rules(&cfg.params)?,
            headers: rules(&cfg.headers)?,
        })
    }

    fn accepts(&self, http: &[u8]) -> bool {
        if !self.methods.is_empty() {
            let method = proto::method(http);
            if !self.methods.iter().any(|m| m == method) {
                return false;
            }
        }

        let path = proto::path(http);
        if !self.url_regexp.is_empty() && !self.url_regexp.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.url_negative_regexp.iter().any(|re| re.is_match(path)) {
            return false;
        }

        // absent headers never filter
        for f in &self.header_filters {
            match proto::header(http, f.name.as_bytes()) {
                Some(value) if !value.is_empty() && !f.regexp.is_match(value) => return false,
                _ => {}
            }
        }
        for f in &self.header_negative_filters {
            match proto::header(http, f.name.as_bytes()) {
                Some(value) if !value.is_empty() && f.regexp.is_match(value) => return false,
                _ => {}
            }
        }

        for f in &self.header_hash_filters {
            match proto::header(http, f.name.as_bytes()) {
                Some(value) if !value.is_empty() && !in_sample(value, f.percent) => return false,
                _ => {}
            }
        }
        for f in &self.param_hash_filters {
            if let Some(value) = proto::path_param(http, f.name.as_bytes()) {
                if !in_sample(value, f.percent) {
                    return false;
                }
            }
        }
        true
    }

    /// Applies the rewrite stages, or `None` when nothing changed.
    fn rewrite(&self, http: &[u8]) -> Option<Vec<u8>> {
        let mut out: Option<Vec<u8>> = None;

        let path = proto::path(http);
        if let Some(rule) = self.url_rewrite.iter().find(|r| r.pattern.is_match(path)) {
            let rewritten = rule.pattern.replace_all(path, rule.replacement.as_slice());
            debug!(
                from = %String::from_utf8_lossy(path),
                to = %String::from_utf8_lossy(&rewritten),
                "url rewritten"
            );
            out = Some(proto::set_path(http, &rewritten));
        }
        for (name, value) in &self.params {
            let current = out.as_deref().unwrap_or(http);
            out = Some(proto::set_path_param(current, name.as_bytes(), value.as_bytes()));
        }
        for (name, value) in &self.headers {
            let current = out.as_deref().unwrap_or(http);
            out = Some(proto::set_header(current, name.as_bytes(), value.as_bytes()));
        }
        out
    }
}

impl Modifier for HttpModifier {
    fn transform(&self, payload: Bytes) -> Bytes {
        if !wire::is_request(&payload) {
            return payload;
        }
        let Ok(meta) = wire::parse_header(&payload) else {
            return payload;
        };
        let http = &payload[meta.body_offset..];
        if !proto::is_http_payload(http) {
            return payload;
        }
        if !self.accepts(http) {
            return Bytes::new();
        }
        match self.rewrite(http) {
            Some(body) => {
                let mut out = Vec::with_capacity(meta.body_offset + body.len());
                out.extend_from_slice(&payload[..meta.body_offset]);
                out.extend_from_slice(&body);
                Bytes::from(out)
            }
            None => payload,
        }
    }
}

/// FNV-1a 32 bucket of `value`, kept when below `percent`.
fn in_sample(value: &[u8], percent: u32) -> bool {
    fnv1a32(value) % 100 < percent
}

fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter()
        .fold(OFFSET, |hash, &b| (hash ^ u32::from(b)).wrapping_mul(PRIME))
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("url regexp {p:?}")))
        .collect()
}

fn header_filters(raw: &[String]) -> Result<Vec<HeaderFilter>> {
    raw.iter()
        .map(|rule| {
            let (name, pattern) = parse_header_rule(rule)?;
            let regexp =
                Regex::new(&pattern).with_context(|| format!("header filter {rule:?}"))?;
            Ok(HeaderFilter { name, regexp })
        })
        .collect()
}

fn hash_filters(raw: &[String]) -> Result<Vec<HashFilter>> {
    raw.iter()
        .map(|rule| {
            let (name, pct) = parse_header_rule(rule)?;
            match parse_limit(&pct)? {
                LimitSpec::Percent(percent) => Ok(HashFilter { name, percent }),
                LimitSpec::Absolute(_) => {
                    Err(anyhow!("hash filter {rule:?} must end with a percentage"))
                }
            }
        })
        .collect()
}

fn rules(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter().map(|rule| parse_header_rule(rule)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpx_core::wire::PayloadKind;

    fn request(http: &str) -> Bytes {
        wire::encode_record(PayloadKind::Request, "a1", 7, http.as_bytes())
    }

    fn modifier(cfg: ModifierConfig) -> HttpModifier {
        HttpModifier::from_config(&cfg).expect("modifier")
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn responses_pass_through() {
        let m = modifier(ModifierConfig {
            methods: strings(&["POST"]),
            ..ModifierConfig::default()
        });
        let response =
            wire::encode_record(PayloadKind::Response, "a1", 3, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(m.transform(response.clone()), response);
    }

    #[test]
    fn method_allow_list() {
        let m = modifier(ModifierConfig {
            methods: strings(&["post", "PUT"]),
            ..ModifierConfig::default()
        });
        assert!(m.transform(request("GET / HTTP/1.1\r\n\r\n")).is_empty());
        let post = request("POST /a HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(m.transform(post.clone()), post);
    }

    #[test]
    fn url_filters() {
        let m = modifier(ModifierConfig {
            url_regexp: strings(&["^/api/"]),
            url_negative_regexp: strings(&["/internal"]),
            ..ModifierConfig::default()
        });
        assert!(m.transform(request("GET /static/a.css HTTP/1.1\r\n\r\n")).is_empty());
        assert!(m.transform(request("GET /api/internal/x HTTP/1.1\r\n\r\n")).is_empty());
        assert!(!m.transform(request("GET /api/users HTTP/1.1\r\n\r\n")).is_empty());
    }

    #[test]
    fn header_filters_ignore_absent_headers() {
        let m = modifier(ModifierConfig {
            header_filters: strings(&["Host: ^www\\."]),
            header_negative_filters: strings(&["User-Agent: bot"]),
            ..ModifierConfig::default()
        });
        assert!(!m.transform(request("GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n")).is_empty());
        assert!(m.transform(request("GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n")).is_empty());
        assert!(m
            .transform(request("GET / HTTP/1.1\r\nHost: www.a\r\nUser-Agent: googlebot\r\n\r\n"))
            .is_empty());
        assert!(!m.transform(request("GET / HTTP/1.1\r\n\r\n")).is_empty());
    }

    #[test]
    fn hash_filters_are_deterministic() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);

        let none = modifier(ModifierConfig {
            header_hash_filters: strings(&["X-User: 0%"]),
            ..ModifierConfig::default()
        });
        let all = modifier(ModifierConfig {
            param_hash_filters: strings(&["user: 100%"]),
            ..ModifierConfig::default()
        });
        let req = "GET /?user=42 HTTP/1.1\r\nX-User: 42\r\n\r\n";
        assert!(none.transform(request(req)).is_empty());
        assert!(!all.transform(request(req)).is_empty());

        let half = modifier(ModifierConfig {
            header_hash_filters: strings(&["X-User: 50%"]),
            ..ModifierConfig::default()
        });
        let kept = (0..200)
            .filter(|i| {
                let req = format!("GET / HTTP/1.1\r\nX-User: user-{i}\r\n\r\n");
                !half.transform(request(&req)).is_empty()
            })
            .count();
        assert!((60..=140).contains(&kept), "kept {kept} of 200");
        let first = half.transform(request("GET / HTTP/1.1\r\nX-User: user-1\r\n\r\n"));
        let again = half.transform(request("GET / HTTP/1.1\r\nX-User: user-1\r\n\r\n"));
        assert_eq!(first, again);
    }

    #[test]
    fn rewrites_keep_the_record_header() {
        let m = modifier(ModifierConfig {
            url_rewrite: strings(&["^/v1/(.*):/v2/$1"]),
            params: strings(&["shadow: 1"]),
            headers: strings(&["Host: staging", "X-Shadow: yes"]),
            ..ModifierConfig::default()
        });
        let out = m.transform(request("GET /v1/users?id=3 HTTP/1.1\r\nHost: prod\r\n\r\n"));
        let meta = wire::parse_header(&out).expect("meta");
        assert_eq!(meta.uuid, "a1");
        assert_eq!(meta.timing, 7);
        let http = &out[meta.body_offset..];
        assert_eq!(proto::path(http), b"/v2/users?id=3&shadow=1");
        assert_eq!(proto::header(http, b"host"), Some(&b"staging"[..]));
        assert_eq!(proto::header(http, b"X-Shadow"), Some(&b"yes"[..]));
    }

    #[test]
    fn untouched_requests_are_not_copied() {
        let m = modifier(ModifierConfig::default());
        let req = request("GET / HTTP/1.1\r\n\r\n");
        let out = m.transform(req.clone());
        assert_eq!(out.as_ptr(), req.as_ptr());
    }

    #[test]
    fn bad_rules_fail_to_compile() {
        let err = HttpModifier::from_config(&ModifierConfig {
            header_hash_filters: strings(&["X-User: 10"]),
            ..ModifierConfig::default()
        })
        .err()
        .expect("absolute hash filter");
        assert!(err.to_string().contains("percentage"));
        assert!(HttpModifier::from_config(&ModifierConfig {
            url_regexp: strings(&["("]),
            ..ModifierConfig::default()
        })
        .is_err());
    }
}
