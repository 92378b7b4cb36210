/*!
Test support helpers shared across integration tests.

- start_tap_with(backend, token): run a tap on 127.0.0.1:0 over the given backend
- mirror_put / mirror_put_chunked: replay a mirrored session-prepare request
- post_message: raw request to the retrieval channel
- http_send_raw: write a raw request, read until close
- send_with_body: same, with socket errors surfaced instead of swallowed
- wait_until: poll a condition with a deadline
*/

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use ctxtap::{
    start_tap, ContextStore, MessageRouter, RequestFilter, SlotBackend, TapConfig, TapHandle,
    TrafficObserver, DEFAULT_SLOT_KEY,
};

pub const PREPARE_PATH: &str = "/api/v1/context/session/prepare";

#[allow(dead_code)]
pub fn port_from_http_url(url: &str) -> u16 {
    let after = url.split("://").nth(1).unwrap_or(url);
    let host_port = after.split('/').next().unwrap_or(after);
    host_port
        .rsplit(':')
        .next()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0)
}

/// Start a tap with the session-prepare filter over `backend`.
#[allow(dead_code)]
pub fn start_tap_with<B: SlotBackend>(
    backend: B,
    token: Option<&str>,
) -> (TapHandle, ContextStore, u16) {
    let store = ContextStore::open(backend, DEFAULT_SLOT_KEY).expect("open store");
    let observer = TrafficObserver::new(RequestFilter::session_prepare(), store.clone());
    let router = MessageRouter::with_defaults(store.clone());
    let cfg = TapConfig {
        listen: "127.0.0.1:0".to_string(),
        unix_socket: None,
        token: token.map(|t| t.to_string()),
        reply_timeout: Duration::from_secs(5),
    };
    let tap = start_tap(&cfg, observer, router).expect("start tap");
    let port = port_from_http_url(tap.url());
    (tap, store, port)
}

#[allow(dead_code)]
pub fn http_send_raw(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    stream.write_all(request.as_bytes()).expect("write failed");
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

/// Status code of a raw response (0 when unparsable).
#[allow(dead_code)]
pub fn status_of(resp: &str) -> u16 {
    resp.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Body of a raw response (everything after the header terminator).
#[allow(dead_code)]
pub fn body_of(resp: &str) -> &str {
    resp.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Replay a mirrored request the way an nginx `mirror` would send it.
#[allow(dead_code)]
pub fn mirror_put(port: u16, method: &str, path: &str, body: &str) -> String {
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: app.example.com\r\nX-Forwarded-Proto: https\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    http_send_raw(port, &req)
}

/// Mirrored PUT with a chunked body; each slice is sent as one wire chunk.
#[allow(dead_code)]
pub fn mirror_put_chunked(port: u16, chunks: &[&str]) -> String {
    let mut req = format!(
        "PUT {PREPARE_PATH} HTTP/1.1\r\nHost: app.example.com\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    );
    for c in chunks {
        req.push_str(&format!("{:x}\r\n{c}\r\n", c.len()));
    }
    req.push_str("0\r\n\r\n");
    http_send_raw(port, &req)
}

#[allow(dead_code)]
pub fn post_message(port: u16, token: Option<&str>, body: &str) -> String {
    let mut req = format!(
        "POST /_ctxtap/message HTTP/1.1\r\nHost: ctxtap\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(t) = token {
        req.push_str(&format!("Authorization: Bearer {t}\r\n"));
    }
    req.push_str("\r\n");
    req.push_str(body);
    http_send_raw(port, &req)
}

/// Poll `cond` every 20ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Write `head` then `body` and read the reply until close. Socket errors are
/// returned as text so callers can tell a reset from a clean close.
#[allow(dead_code)]
pub fn send_with_body(port: u16, head: &str, body: &[u8]) -> Result<String, String> {
    let mut stream =
        TcpStream::connect(("127.0.0.1", port)).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .map_err(|e| format!("read timeout: {e}"))?;
    stream
        .write_all(head.as_bytes())
        .map_err(|e| format!("head write: {e}"))?;
    stream
        .write_all(body)
        .map_err(|e| format!("body write: {e}"))?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(|e| format!("read: {e} (got {} bytes)", buf.len()))?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}
