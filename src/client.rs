/*!
Client side of the retrieval channel.

Speaks the tap's control endpoints over TCP (`http://host:port`) or a unix
socket (`unix:///path`). One request per connection, `Connection: close`.
Connect and read timeouts both surface as `ChannelError::Timeout`; refused
connections and replies that never arrive are `ChannelError::NoResponse`.
*/

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::channel::{ContextResponse, Request, VersionResponse};
use crate::config::Config;
use crate::errors::ChannelError;
use crate::http::{self, HttpResponse};
use crate::tap::{HEALTH_PATH, MESSAGE_PATH};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RetrievalClient {
    endpoint: Endpoint,
    token: Option<String>,
    timeout: Duration,
}

fn parse_endpoint(url: &str) -> Result<Endpoint, ChannelError> {
    if let Some(path) = url.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(ChannelError::Protocol(format!("unix url has no path: '{url}'")));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    let parsed = url::Url::parse(url)
        .map_err(|e| ChannelError::Protocol(format!("invalid service url '{url}': {e}")))?;
    if parsed.scheme() != "http" {
        return Err(ChannelError::Protocol(format!(
            "unsupported scheme '{}' (use http:// or unix://)",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| ChannelError::Protocol(format!("service url has no host: '{url}'")))?;
    let port = parsed.port_or_known_default().unwrap_or(80);
    Ok(Endpoint::Tcp(format!("{host}:{port}")))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Write the request, then read until the server closes.
fn roundtrip<S: Read + Write>(
    stream: &mut S,
    request: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, ChannelError> {
    stream.write_all(request).map_err(|e| {
        if is_timeout(&e) {
            ChannelError::Timeout(timeout)
        } else {
            ChannelError::NoResponse(format!("write failed: {e}"))
        }
    })?;
    let _ = stream.flush();
    let mut buf = Vec::new();
    match stream.read_to_end(&mut buf) {
        Ok(_) => {}
        Err(e) if is_timeout(&e) => return Err(ChannelError::Timeout(timeout)),
        Err(e) if buf.is_empty() => {
            return Err(ChannelError::NoResponse(format!("read failed: {e}")))
        }
        // Peer reset after a complete reply; keep what arrived.
        Err(_) => {}
    }
    if buf.is_empty() {
        return Err(ChannelError::NoResponse(
            "connection closed without a reply".to_string(),
        ));
    }
    Ok(buf)
}

fn is_json(resp: &HttpResponse) -> bool {
    resp.headers
        .get("content-type")
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

impl RetrievalClient {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ChannelError> {
        Ok(RetrievalClient {
            endpoint: parse_endpoint(url.trim())?,
            token: token.filter(|t| !t.trim().is_empty()),
            timeout,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ChannelError> {
        RetrievalClient::new(
            &cfg.effective_service_url(),
            cfg.token.clone(),
            cfg.timeout,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn request_bytes(&self, method: &str, path: &str, body: Option<&[u8]>) -> Vec<u8> {
        let mut head = format!("{method} {path} HTTP/1.1\r\nHost: ctxtap\r\nConnection: close\r\n");
        if let Some(t) = &self.token {
            head.push_str(&format!("Authorization: Bearer {t}\r\n"));
        }
        if let Some(b) = body {
            head.push_str(&format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\n",
                b.len()
            ));
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        if let Some(b) = body {
            out.extend_from_slice(b);
        }
        out
    }

    fn exchange(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, ChannelError> {
        let request = self.request_bytes(method, path, body);
        let raw = match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let mut stream = self.connect_tcp(addr)?;
                let _ = stream.set_read_timeout(Some(self.timeout));
                let _ = stream.set_write_timeout(Some(self.timeout));
                roundtrip(&mut stream, &request, self.timeout)?
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let mut stream = UnixStream::connect(path).map_err(|e| {
                    ChannelError::NoResponse(format!("connect {}: {e}", path.display()))
                })?;
                let _ = stream.set_read_timeout(Some(self.timeout));
                let _ = stream.set_write_timeout(Some(self.timeout));
                roundtrip(&mut stream, &request, self.timeout)?
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => {
                return Err(ChannelError::Protocol(format!(
                    "unix sockets are not supported on this platform ({})",
                    path.display()
                )))
            }
        };
        http::parse_response(&raw).map_err(|e| ChannelError::Protocol(e.to_string()))
    }

    fn connect_tcp(&self, addr: &str) -> Result<TcpStream, ChannelError> {
        let addrs = addr
            .to_socket_addrs()
            .map_err(|e| ChannelError::NoResponse(format!("resolve {addr}: {e}")))?;
        let mut last: Option<io::Error> = None;
        for sa in addrs {
            match TcpStream::connect_timeout(&sa, self.timeout) {
                Ok(s) => return Ok(s),
                Err(e) => last = Some(e),
            }
        }
        match last {
            Some(e) if is_timeout(&e) => Err(ChannelError::Timeout(self.timeout)),
            Some(e) => Err(ChannelError::NoResponse(format!("connect {addr}: {e}"))),
            None => Err(ChannelError::NoResponse(format!(
                "{addr} resolved to no addresses"
            ))),
        }
    }

    /// Send one channel message. `Ok(None)` when no handler owns the action.
    pub fn send(&self, request: &Request) -> Result<Option<Value>, ChannelError> {
        let body = request.to_value().to_string();
        let resp = self.exchange("POST", MESSAGE_PATH, Some(body.as_bytes()))?;
        let text = String::from_utf8_lossy(&resp.body).trim().to_string();
        match resp.status {
            200 if !is_json(&resp) => Err(ChannelError::Protocol(format!(
                "reply content-type is {}, expected application/json",
                resp.headers
                    .get("content-type")
                    .map(String::as_str)
                    .unwrap_or("missing")
            ))),
            200 => serde_json::from_slice::<Value>(&resp.body)
                .map(Some)
                .map_err(|e| ChannelError::Protocol(format!("reply is not json: {e}"))),
            204 => Ok(None),
            401 => Err(ChannelError::Protocol(
                "unauthorized (check CTXTAP_TOKEN)".to_string(),
            )),
            504 => Err(ChannelError::Timeout(self.timeout)),
            503 => Err(ChannelError::NoResponse(text)),
            other => Err(ChannelError::Protocol(format!(
                "unexpected status {other}: {text}"
            ))),
        }
    }

    /// Latest captured fragment, `None` when nothing was captured yet.
    pub fn get_latest_context(&self) -> Result<Option<Value>, ChannelError> {
        let reply = self.send(&Request::GetLatestContext)?.ok_or_else(|| {
            ChannelError::NoResponse("nothing answered getLatestContext".to_string())
        })?;
        let resp: ContextResponse = serde_json::from_value(reply)
            .map_err(|e| ChannelError::Protocol(format!("unexpected reply shape: {e}")))?;
        Ok(resp.fragment.filter(|v| !v.is_null()))
    }

    pub fn get_version(&self) -> Result<String, ChannelError> {
        let reply = self
            .send(&Request::GetVersion)?
            .ok_or_else(|| ChannelError::NoResponse("nothing answered getVersion".to_string()))?;
        let resp: VersionResponse = serde_json::from_value(reply)
            .map_err(|e| ChannelError::Protocol(format!("unexpected reply shape: {e}")))?;
        Ok(resp.version)
    }

    pub fn health(&self) -> Result<(), ChannelError> {
        let resp = self.exchange("GET", HEALTH_PATH, None)?;
        match resp.status {
            200 => Ok(()),
            401 => Err(ChannelError::Protocol(
                "unauthorized (check CTXTAP_TOKEN)".to_string(),
            )),
            other => Err(ChannelError::Protocol(format!("unexpected status {other}"))),
        }
    }

    /// Fetch for display: any failure collapses to the empty state.
    pub fn fetch_for_display(&self) -> Option<Value> {
        match self.get_latest_context() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "context retrieval failed; showing empty state");
                None
            }
        }
    }
}
