/*!
Tap module: listener setup, accept loop, and per-connection dispatch.

- Listener on TCP (default) or a unix socket, accept loop with backoff.
- Everything outside `/_ctxtap/` is mirrored application traffic: the
  observer's filter is tested on method and URL first; only wanted requests
  have their body parsed and run through the capture pipeline, the rest are
  drained unparsed. The answer is always an empty `204`, whatever happened.
- `/_ctxtap/message`: retrieval channel (JSON message in, JSON reply out;
  `204` when no handler owns the action).
- `/_ctxtap/health`: liveness.
- Optional bearer token guards the control endpoints only.
*/

use std::io::{self, Read, Write};
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;

use crate::auth::{check_control_auth, ControlAuth};
use crate::channel::{MessageRouter, Request};
use crate::errors::ChannelError;
use crate::http::{self, RequestHead};
use crate::observer::{new_request_id, CapturedRequest, TrafficObserver};

pub const CONTROL_PREFIX: &str = "/_ctxtap/";
pub const MESSAGE_PATH: &str = "/_ctxtap/message";
pub const HEALTH_PATH: &str = "/_ctxtap/health";

/// Per-connection read timeout; a stalled peer only ever ties up its own thread.
const CONN_READ_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapConfig {
    /// `host:port`; port 0 picks a free port.
    pub listen: String,
    pub unix_socket: Option<PathBuf>,
    pub token: Option<String>,
    /// Upper bound for resolving deferred channel replies.
    pub reply_timeout: Duration,
}

struct TapCtx {
    observer: TrafficObserver,
    router: MessageRouter,
    token: Option<String>,
    reply_timeout: Duration,
}

/// Running tap. `stop` flips the running flag and joins the accept loop.
#[derive(Debug)]
pub struct TapHandle {
    url: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TapHandle {
    /// `http://127.0.0.1:<port>` or `unix:///path`.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

// Response helpers
fn respond<W: Write>(w: &mut W, status: &str, content_type: Option<&str>, body: &[u8]) {
    let mut header = format!("HTTP/1.1 {status}\r\n");
    if let Some(ct) = content_type {
        header.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    header.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(body);
    let _ = w.flush();
}

fn respond_plain<W: Write>(w: &mut W, status: &str, body: &[u8]) {
    respond(w, status, Some("text/plain; charset=utf-8"), body);
}

fn respond_json<W: Write>(w: &mut W, value: &Value) {
    let body = value.to_string();
    respond(w, "200 OK", Some("application/json"), body.as_bytes());
}

fn respond_no_content<W: Write>(w: &mut W) {
    let _ = w.write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n");
    let _ = w.flush();
}

/// Reconstruct the URL the observed application requested.
///
/// Absolute-form targets are taken as-is. Otherwise scheme comes from
/// `X-Forwarded-Proto` (default http), host from `X-Forwarded-Host` or `Host`,
/// and the path from `X-Original-URI`/`X-Original-Url` or the request target.
pub(crate) fn effective_url(head: &RequestHead) -> String {
    let lower = head.target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return head.target.clone();
    }
    let scheme = head
        .header("x-forwarded-proto")
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "http".to_string());
    let host = head
        .header("x-forwarded-host")
        .or_else(|| head.header("host"))
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("localhost");
    let target = head
        .header("x-original-uri")
        .or_else(|| head.header("x-original-url"))
        .filter(|s| s.starts_with('/'))
        .unwrap_or(&head.target);
    format!("{scheme}://{host}{target}")
}

fn handle_connection<S: Read + Write>(ctx: &TapCtx, stream: &mut S) {
    let head = match http::read_request_head(stream) {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable request head");
            respond_plain(stream, "400 Bad Request", b"bad request\n");
            return;
        }
    };
    if head.path_lc.starts_with(CONTROL_PREFIX) {
        handle_control(ctx, stream, &head);
    } else {
        handle_mirror(ctx, stream, &head);
    }
}

fn handle_mirror<S: Read + Write>(ctx: &TapCtx, stream: &mut S, head: &RequestHead) {
    let url = effective_url(head);
    if !ctx.observer.wants(&head.method, &url) {
        respond_no_content(stream);
        drain_unread(stream, head);
        return;
    }
    let request_id = head
        .header("x-request-id")
        .map(|s| s.to_string())
        .unwrap_or_else(new_request_id);
    let body = match http::read_body_chunks(stream, head) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(
                request_id = %request_id,
                method = %head.method,
                url = %url,
                error = %e,
                "mirrored body unreadable"
            );
            Vec::new()
        }
    };
    let req = CapturedRequest {
        request_id,
        url,
        method: head.method.clone(),
        body,
    };
    let directive = ctx.observer.on_before_request(&req);
    debug_assert!(directive.is_passthrough());
    respond_no_content(stream);
}

/// Read a body we answered without looking at; unread input would turn our
/// close into a reset.
fn drain_unread<S: Read>(stream: &mut S, head: &RequestHead) {
    if let Err(e) = http::discard_body(stream, head) {
        tracing::debug!(method = %head.method, path = %head.path_lc, error = %e, "request body not drained");
    }
}

fn handle_control<S: Read + Write>(ctx: &TapCtx, stream: &mut S, head: &RequestHead) {
    if check_control_auth(&head.headers, ctx.token.as_deref()) == ControlAuth::Denied {
        tracing::warn!(path = %head.path_lc, "control request rejected: bad or missing token");
        respond_plain(stream, "401 Unauthorized", b"unauthorized\n");
        drain_unread(stream, head);
        return;
    }
    let method = head.method.to_ascii_uppercase();
    match (method.as_str(), head.path_lc.as_str()) {
        ("POST", MESSAGE_PATH) => return handle_message(ctx, stream, head),
        ("GET", HEALTH_PATH) => respond_plain(stream, "200 OK", b"ok\n"),
        (_, HEALTH_PATH) | (_, MESSAGE_PATH) => {
            respond_plain(stream, "405 Method Not Allowed", b"method not allowed\n")
        }
        _ => respond_plain(stream, "404 Not Found", b"not found\n"),
    }
    drain_unread(stream, head);
}

fn handle_message<S: Read + Write>(ctx: &TapCtx, stream: &mut S, head: &RequestHead) {
    let body: Vec<u8> = match http::read_body_chunks(stream, head) {
        Ok(chunks) => chunks.concat(),
        Err(e) => {
            respond_plain(stream, "400 Bad Request", format!("{e}\n").as_bytes());
            return;
        }
    };
    let request = match serde_json::from_slice::<Value>(&body)
        .map_err(|e| ChannelError::Protocol(format!("invalid json: {e}")))
        .and_then(|v| Request::from_value(&v))
    {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting channel message");
            respond_plain(stream, "400 Bad Request", format!("{e}\n").as_bytes());
            return;
        }
    };
    let reply = match ctx.router.dispatch(&request) {
        Some(r) => r,
        None => {
            respond_no_content(stream);
            return;
        }
    };
    match reply.resolve(ctx.reply_timeout) {
        Ok(v) => {
            tracing::debug!(action = request.action(), "channel reply sent");
            respond_json(stream, &v);
        }
        Err(e @ ChannelError::Timeout(_)) => {
            tracing::warn!(action = request.action(), error = %e, "channel reply timed out");
            respond_plain(stream, "504 Gateway Timeout", format!("{e}\n").as_bytes());
        }
        Err(e) => {
            tracing::warn!(action = request.action(), error = %e, "channel reply failed");
            respond_plain(stream, "503 Service Unavailable", format!("{e}\n").as_bytes());
        }
    }
}

fn accept_loop<S, F>(mut accept: F, ctx: Arc<TapCtx>, running: Arc<AtomicBool>)
where
    S: Read + Write + Send + 'static,
    F: FnMut() -> io::Result<S>,
{
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let stream = match accept() {
            Ok(s) => s,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::warn!(error = %e, "accept error");
                }
                std::thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };
        let ctx_cl = ctx.clone();
        let spawned = std::thread::Builder::new()
            .name("ctxtap-conn".to_string())
            .spawn(move || {
                let mut s = stream;
                handle_connection(&ctx_cl, &mut s);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn connection thread");
        }
    }
}

/// Start the tap. Listeners are installed once here and live until `stop`.
pub fn start_tap(
    cfg: &TapConfig,
    observer: TrafficObserver,
    router: MessageRouter,
) -> io::Result<TapHandle> {
    let ctx = Arc::new(TapCtx {
        observer,
        router,
        token: cfg.token.clone().filter(|t| !t.is_empty()),
        reply_timeout: cfg.reply_timeout,
    });
    let running = Arc::new(AtomicBool::new(true));

    #[cfg(unix)]
    if let Some(sock_path) = cfg.unix_socket.clone() {
        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("tap unix bind {} failed: {e}", sock_path.display()),
            )
        })?;
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o600));
        }
        listener.set_nonblocking(true)?;
        let url = format!("unix://{}", sock_path.display());
        let running_cl = running.clone();
        let handle = std::thread::Builder::new()
            .name("ctxtap-accept".to_string())
            .spawn(move || {
                tracing::info!(socket = %sock_path.display(), "tap listening on unix socket");
                let accept = || {
                    listener.accept().map(|(s, _)| {
                        let _ = s.set_nonblocking(false);
                        let _ = s.set_read_timeout(Some(CONN_READ_TIMEOUT));
                        s
                    })
                };
                accept_loop(accept, ctx, running_cl);
                let _ = std::fs::remove_file(&sock_path);
                tracing::info!("tap stopped");
            })?;
        return Ok(TapHandle {
            url,
            running,
            handle,
        });
    }

    let listener = TcpListener::bind(cfg.listen.as_str()).map_err(|e| {
        io::Error::new(e.kind(), format!("tap bind {} failed: {e}", cfg.listen))
    })?;
    let mut addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let bound = addr;
    if addr.ip().is_unspecified() {
        addr.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
    }
    let url = format!("http://{addr}");
    let running_cl = running.clone();
    let handle = std::thread::Builder::new()
        .name("ctxtap-accept".to_string())
        .spawn(move || {
            tracing::info!(addr = %bound, "tap listening");
            let accept = || {
                listener.accept().map(|(s, _)| {
                    let _ = s.set_nonblocking(false);
                    let _ = s.set_read_timeout(Some(CONN_READ_TIMEOUT));
                    s
                })
            };
            accept_loop(accept, ctx, running_cl);
            tracing::info!("tap stopped");
        })?;
    Ok(TapHandle {
        url,
        running,
        handle,
    })
}
