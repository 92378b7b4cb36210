/*!
Traffic observer: request filter and capture pipeline.

The observer sees requests before (or alongside) their delivery and never
changes them. For each request matching the filter it runs
decode → extract → store; the store write is dispatched without waiting.
Requests that do not match are not evaluated beyond the method and URL test.
*/

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, SystemTime};

use url::Url;

use crate::decoder::decode_payload;
use crate::errors::{CaptureError, StoreError};
use crate::extractor::extract_context;
use crate::fragment::ContextFragment;
use crate::store::ContextStore;

/// URL pattern of the session-prepare call that carries the context.
pub const SESSION_PREPARE_PATTERN: &str = "*://*/api/v1/context/session/prepare*";
/// Method of the session-prepare call.
pub const SESSION_PREPARE_METHOD: &str = "PUT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternError(String);

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid url pattern: {}", self.0)
    }
}

impl std::error::Error for PatternError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    /// `*.example.com`: the domain itself and any subdomain.
    Suffix(String),
    Exact(String),
}

/// Browser-style match pattern: `<scheme>://<host><path>`.
///
/// - scheme `*` matches http and https
/// - host `*` matches any host, `*.example.com` a domain and its subdomains
/// - path is a glob (`*` = any run of characters) matched against path and query
/// - `<all_urls>` matches every http(s) URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    raw: String,
    scheme: Option<String>,
    host: HostPattern,
    path: String,
}

impl UrlPattern {
    pub fn parse(raw: &str) -> Result<UrlPattern, PatternError> {
        let raw = raw.trim();
        if raw == "<all_urls>" {
            return Ok(UrlPattern {
                raw: raw.to_string(),
                scheme: None,
                host: HostPattern::Any,
                path: "/*".to_string(),
            });
        }
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| PatternError(format!("{raw}: missing '://'")))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme.is_empty()
            || !(scheme == "*" || scheme.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(PatternError(format!("{raw}: bad scheme '{scheme}'")));
        }
        let slash = rest
            .find('/')
            .ok_or_else(|| PatternError(format!("{raw}: missing path")))?;
        let (host, path) = rest.split_at(slash);
        let host = host.to_ascii_lowercase();
        let host = if host == "*" {
            HostPattern::Any
        } else if let Some(domain) = host.strip_prefix("*.") {
            if domain.is_empty() || domain.contains('*') {
                return Err(PatternError(format!("{raw}: bad host wildcard")));
            }
            HostPattern::Suffix(domain.to_string())
        } else if host.is_empty() || host.contains('*') {
            return Err(PatternError(format!("{raw}: bad host '{host}'")));
        } else {
            HostPattern::Exact(host)
        };
        Ok(UrlPattern {
            raw: raw.to_string(),
            scheme: if scheme == "*" { None } else { Some(scheme) },
            host,
            path: path.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, url: &Url) -> bool {
        let scheme_ok = match &self.scheme {
            None => matches!(url.scheme(), "http" | "https"),
            Some(s) => url.scheme() == s,
        };
        if !scheme_ok {
            return false;
        }
        let host = url.host_str().unwrap_or("");
        let host_ok = match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact(h) => host == h,
            HostPattern::Suffix(d) => {
                host == d
                    || (host.len() > d.len()
                        && host.ends_with(d.as_str())
                        && host.as_bytes()[host.len() - d.len() - 1] == b'.')
            }
        };
        if !host_ok {
            return false;
        }
        let mut target = url.path().to_string();
        if let Some(q) = url.query() {
            target.push('?');
            target.push_str(q);
        }
        glob_match(&self.path, &target)
    }
}

/// `*` matches any run of bytes (including none); everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Which requests the observer inspects.
#[derive(Debug, Clone)]
pub struct RequestFilter {
    patterns: Vec<UrlPattern>,
    methods: Vec<String>,
    capture_body: bool,
}

impl RequestFilter {
    pub fn new(patterns: Vec<UrlPattern>, methods: Vec<String>) -> Self {
        RequestFilter {
            patterns,
            methods: methods
                .into_iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
            capture_body: true,
        }
    }

    /// `PUT *://*/api/v1/context/session/prepare*` with body capture.
    pub fn session_prepare() -> Self {
        let pattern = UrlPattern::parse(SESSION_PREPARE_PATTERN)
            .unwrap_or_else(|e| unreachable!("built-in pattern is valid: {e}"));
        RequestFilter::new(vec![pattern], vec![SESSION_PREPARE_METHOD.to_string()])
    }

    /// Without body capture every matching request ends as `NoBody`.
    pub fn with_capture_body(mut self, capture: bool) -> Self {
        self.capture_body = capture;
        self
    }

    pub fn captures_body(&self) -> bool {
        self.capture_body
    }

    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Method first (cheapest), then URL patterns.
    pub fn matches(&self, method: &str, url: &str) -> bool {
        if !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }
        match Url::parse(url) {
            Ok(parsed) => self.patterns.iter().any(|p| p.matches(&parsed)),
            Err(_) => false,
        }
    }
}

/// One observed outbound request. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRequest {
    /// Diagnostics and log correlation only.
    pub request_id: String,
    pub url: String,
    pub method: String,
    /// Raw body in arrival order; possibly split into several chunks.
    pub body: Vec<Vec<u8>>,
}

/// Directive handed back to the network layer. The observer only ever returns
/// the empty one: no cancel, no redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockingResponse {
    pub cancel: bool,
    pub redirect_url: Option<String>,
}

impl BlockingResponse {
    pub fn is_passthrough(&self) -> bool {
        !self.cancel && self.redirect_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Fragment extracted and its store write dispatched.
    Captured(ContextFragment),
    Rejected(CaptureError),
}

/// Filter plus capture pipeline, writing into the context store.
#[derive(Debug, Clone)]
pub struct TrafficObserver {
    filter: RequestFilter,
    store: ContextStore,
}

impl TrafficObserver {
    pub fn new(filter: RequestFilter, store: ContextStore) -> Self {
        TrafficObserver { filter, store }
    }

    pub fn filter(&self) -> &RequestFilter {
        &self.filter
    }

    /// Pattern test alone; lets transports skip reading bodies nobody wants.
    pub fn wants(&self, method: &str, url: &str) -> bool {
        self.filter.matches(method, url)
    }

    /// Run the pipeline for one request. `None` when the filter did not match.
    pub fn inspect(&self, req: &CapturedRequest) -> Option<CaptureOutcome> {
        if !self.filter.matches(&req.method, &req.url) {
            return None;
        }
        #[cfg(test)]
        if tests::FAIL_INSPECT.with(|f| f.get()) {
            panic!("inspect failure injected for {}", req.request_id);
        }
        let chunks: &[Vec<u8>] = if self.filter.capture_body {
            &req.body
        } else {
            &[]
        };
        let outcome = match decode_payload(chunks).and_then(|payload| extract_context(&payload)) {
            Ok(fragment) => {
                // Fire and forget: the request must not wait on persistence.
                let pending = self.store.set_latest(fragment.clone());
                if let Some(Err(StoreError::Closed)) = pending.try_result() {
                    tracing::warn!(
                        request_id = %req.request_id,
                        method = %req.method,
                        url = %req.url,
                        key = self.store.key(),
                        outcome = "store_closed",
                        "context extracted but the store is gone; write dropped"
                    );
                    return Some(CaptureOutcome::Captured(fragment));
                }
                CaptureOutcome::Captured(fragment)
            }
            Err(e) => CaptureOutcome::Rejected(e),
        };
        log_outcome(req, &outcome);
        Some(outcome)
    }

    /// Network-layer hook. Always returns the empty directive, whatever the
    /// outcome, including a panic inside the pipeline.
    pub fn on_before_request(&self, req: &CapturedRequest) -> BlockingResponse {
        if panic::catch_unwind(AssertUnwindSafe(|| self.inspect(req))).is_err() {
            tracing::error!(
                request_id = %req.request_id,
                method = %req.method,
                url = %req.url,
                outcome = "internal_error",
                "capture pipeline panicked; request left untouched"
            );
        }
        BlockingResponse::default()
    }
}

fn log_outcome(req: &CapturedRequest, outcome: &CaptureOutcome) {
    let body_bytes: usize = req.body.iter().map(|c| c.len()).sum();
    match outcome {
        CaptureOutcome::Captured(_) => tracing::info!(
            request_id = %req.request_id,
            method = %req.method,
            url = %req.url,
            chunks = req.body.len(),
            body_bytes,
            outcome = "captured",
            "context captured"
        ),
        CaptureOutcome::Rejected(e @ (CaptureError::NoBody | CaptureError::FieldMissing)) => {
            tracing::info!(
                request_id = %req.request_id,
                method = %req.method,
                url = %req.url,
                chunks = req.body.len(),
                body_bytes,
                outcome = e.kind(),
                "no context extracted: {e}"
            )
        }
        CaptureOutcome::Rejected(e) => tracing::warn!(
            request_id = %req.request_id,
            method = %req.method,
            url = %req.url,
            chunks = req.body.len(),
            body_bytes,
            outcome = e.kind(),
            "no context extracted: {e}"
        ),
    }
}

/// Fresh id for requests that arrive without one.
pub fn new_request_id() -> String {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        // Fall back to time ^ pid; uniqueness is best-effort.
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_nanos() as u64;
        buf = (now ^ u64::from(std::process::id())).to_be_bytes();
    }
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, DEFAULT_SLOT_KEY};
    use serde_json::json;
    use std::cell::Cell;
    use std::io;
    use std::sync::{Arc, Mutex};

    thread_local! {
        /// Makes `inspect` panic on this thread once the filter matched.
        pub(super) static FAIL_INSPECT: Cell<bool> = const { Cell::new(false) };
    }

    #[derive(Clone, Default)]
    struct LogBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under a plain-text fmt subscriber and return what it logged.
    fn capture_logs<F: FnOnce()>(f: F) -> String {
        let buf = LogBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().expect("log buffer").clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn observer() -> (TrafficObserver, ContextStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = ContextStore::open(backend.clone(), DEFAULT_SLOT_KEY).expect("open store");
        (
            TrafficObserver::new(RequestFilter::session_prepare(), store.clone()),
            store,
            backend,
        )
    }

    fn req(method: &str, url: &str, body: &[u8]) -> CapturedRequest {
        CapturedRequest {
            request_id: "t-1".to_string(),
            url: url.to_string(),
            method: method.to_string(),
            body: vec![body.to_vec()],
        }
    }

    const PREPARE: &str = "https://app.example.com/api/v1/context/session/prepare";

    #[test]
    fn test_pattern_matches_any_host_scheme_and_optional_query() {
        let p = UrlPattern::parse(SESSION_PREPARE_PATTERN).expect("pattern");
        for u in [
            "https://app.example.com/api/v1/context/session/prepare",
            "http://10.0.0.1:8080/api/v1/context/session/prepare?x=1",
            "https://a.b.c/api/v1/context/session/prepare?x=1&y=2",
        ] {
            assert!(p.matches(&Url::parse(u).expect("url")), "should match {u}");
        }
        for u in [
            "https://app.example.com/api/v1/context/session/start",
            "https://app.example.com/v2/api/v1/context/session/prepare",
            "ftp://app.example.com/api/v1/context/session/prepare",
        ] {
            assert!(!p.matches(&Url::parse(u).expect("url")), "should not match {u}");
        }
    }

    #[test]
    fn test_pattern_host_forms() {
        let sub = UrlPattern::parse("https://*.example.com/*").expect("pattern");
        assert!(sub.matches(&Url::parse("https://example.com/").expect("url")));
        assert!(sub.matches(&Url::parse("https://a.example.com/x").expect("url")));
        assert!(!sub.matches(&Url::parse("https://badexample.com/x").expect("url")));
        assert!(!sub.matches(&Url::parse("http://a.example.com/x").expect("url")));

        let exact = UrlPattern::parse("*://Example.COM/a*").expect("pattern");
        assert!(exact.matches(&Url::parse("http://example.com/abc").expect("url")));

        let all = UrlPattern::parse("<all_urls>").expect("pattern");
        assert!(all.matches(&Url::parse("https://x.y/z?q").expect("url")));
    }

    #[test]
    fn test_pattern_parse_errors() {
        for bad in ["no-scheme", "*://host", "*://a*b/x", "*://*./x", "ht tp://h/x"] {
            assert!(UrlPattern::parse(bad).is_err(), "should reject {bad}");
        }
    }

    #[test]
    fn test_glob_match_basics() {
        assert!(glob_match("/a/*", "/a/"));
        assert!(glob_match("/a/*/c", "/a/b/b/c"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("/a", "/a/"));
        assert!(!glob_match("/a*c", "/abd"));
    }

    #[test]
    fn test_filter_method_is_checked() {
        let f = RequestFilter::session_prepare();
        assert!(f.matches("PUT", PREPARE));
        assert!(f.matches("put", PREPARE));
        assert!(!f.matches("GET", PREPARE));
        assert!(!f.matches("POST", PREPARE));
        assert!(!f.matches("PUT", "not a url"));
    }

    #[test]
    fn test_capture_success_updates_store() {
        let (obs, store, _) = observer();
        let out = obs
            .inspect(&req(
                "PUT",
                &format!("{PREPARE}?x=1"),
                br#"{"context":{"sessionId":"abc"}}"#,
            ))
            .expect("matched");
        assert!(matches!(out, CaptureOutcome::Captured(_)));
        let got = store.get_latest().wait().expect("get");
        assert_eq!(got.map(|f| f.into_value()), Some(json!({"sessionId": "abc"})));
    }

    #[test]
    fn test_field_missing_leaves_store_unchanged() {
        let (obs, store, _) = observer();
        obs.inspect(&req("PUT", PREPARE, br#"{"context":{"id":1}}"#));
        let out = obs.inspect(&req("PUT", PREPARE, br#"{"foo":"bar"}"#));
        assert_eq!(out, Some(CaptureOutcome::Rejected(CaptureError::FieldMissing)));
        let got = store.get_latest().wait().expect("get");
        assert_eq!(got.map(|f| f.into_value()), Some(json!({"id": 1})));
    }

    #[test]
    fn test_decode_error_leaves_store_unchanged() {
        let (obs, store, backend) = observer();
        let out = obs.inspect(&req("PUT", PREPARE, &[0xc3, 0x28]));
        assert!(matches!(
            out,
            Some(CaptureOutcome::Rejected(CaptureError::Decode(_)))
        ));
        assert_eq!(store.get_latest().wait(), Ok(None));
        assert_eq!(backend.peek(DEFAULT_SLOT_KEY), None);
    }

    #[test]
    fn test_non_matching_requests_are_not_evaluated() {
        let (obs, store, _) = observer();
        let body = br#"{"context":{"sessionId":"abc"}}"#;
        assert_eq!(obs.inspect(&req("GET", PREPARE, body)), None);
        assert_eq!(
            obs.inspect(&req("PUT", "https://h/api/v1/other", body)),
            None
        );
        assert_eq!(store.get_latest().wait(), Ok(None));
    }

    #[test]
    fn test_on_before_request_is_always_passthrough() {
        let (obs, _, _) = observer();
        for r in [
            req("PUT", PREPARE, br#"{"context":1}"#),
            req("PUT", PREPARE, b"{oops"),
            req("GET", PREPARE, b""),
        ] {
            let directive = obs.on_before_request(&r);
            assert!(directive.is_passthrough());
            assert_eq!(directive, BlockingResponse::default());
        }
    }

    #[test]
    fn test_field_missing_is_logged_against_the_request() {
        let (obs, _, _) = observer();
        let mut r = req("PUT", PREPARE, br#"{"foo":"bar"}"#);
        r.request_id = "fm-7".to_string();
        let logs = capture_logs(|| {
            obs.inspect(&r);
        });
        let line = logs
            .lines()
            .find(|l| l.contains("fm-7"))
            .unwrap_or_else(|| panic!("no line for the request in:\n{logs}"));
        assert!(line.contains("INFO"), "line: {line}");
        assert!(line.contains("outcome=\"field_missing\""), "line: {line}");
        assert!(line.contains("method=PUT"), "line: {line}");
        assert!(line.contains(PREPARE), "line: {line}");
    }

    #[test]
    fn test_pipeline_panic_is_contained_and_logged() {
        let (obs, store, _) = observer();
        let mut r = req("PUT", PREPARE, br#"{"context":{"id":1}}"#);
        r.request_id = "boom-1".to_string();
        FAIL_INSPECT.with(|f| f.set(true));
        let mut directive = None;
        let logs = capture_logs(|| directive = Some(obs.on_before_request(&r)));
        FAIL_INSPECT.with(|f| f.set(false));

        assert_eq!(directive, Some(BlockingResponse::default()));
        let line = logs
            .lines()
            .find(|l| l.contains("internal_error"))
            .unwrap_or_else(|| panic!("no internal_error line in:\n{logs}"));
        assert!(line.contains("ERROR"), "line: {line}");
        assert!(line.contains("boom-1"), "line: {line}");
        assert_eq!(store.get_latest().wait(), Ok(None));
    }

    #[test]
    fn test_closed_store_write_is_logged_against_the_request() {
        let obs = TrafficObserver::new(
            RequestFilter::session_prepare(),
            ContextStore::closed(DEFAULT_SLOT_KEY),
        );
        let mut r = req("PUT", PREPARE, br#"{"context":{"id":1}}"#);
        r.request_id = "gone-3".to_string();
        let mut out = None;
        let logs = capture_logs(|| out = obs.inspect(&r));

        assert!(matches!(out, Some(CaptureOutcome::Captured(_))));
        let line = logs
            .lines()
            .find(|l| l.contains("store_closed"))
            .unwrap_or_else(|| panic!("no store_closed line in:\n{logs}"));
        assert!(line.contains("WARN"), "line: {line}");
        assert!(line.contains("gone-3"), "line: {line}");
        assert!(line.contains("method=PUT"), "line: {line}");
        assert!(line.contains(PREPARE), "line: {line}");
        assert!(!logs.contains("outcome=\"captured\""), "logs: {logs}");
    }

    #[test]
    fn test_body_capture_disabled_yields_no_body() {
        let backend = MemoryBackend::new();
        let store = ContextStore::open(backend, DEFAULT_SLOT_KEY).expect("open store");
        let obs = TrafficObserver::new(
            RequestFilter::session_prepare().with_capture_body(false),
            store,
        );
        let out = obs.inspect(&req("PUT", PREPARE, br#"{"context":1}"#));
        assert_eq!(out, Some(CaptureOutcome::Rejected(CaptureError::NoBody)));
    }

    #[test]
    fn test_request_ids_are_hex_and_distinct() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
