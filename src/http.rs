/*!
HTTP helpers for the tap: tolerant request parsing in two phases.

`read_request_head` reads only the request line and headers (64 KiB cap,
CRLFCRLF or LFLF terminator). The body is read separately with
`read_body_chunks`, so the tap can skip parsing bodies nobody wants;
`discard_body` still reads those off the socket, since closing with unread
input makes the kernel reset the connection. Chunked bodies keep their wire
chunks; a Content-Length body is one chunk. At most 1 MiB is kept and at most
64 MiB drained.
*/

use std::collections::HashMap;
use std::io::{self, Read};

const HDR_CAP: usize = 64 * 1024;
const BODY_CAP: usize = 1024 * 1024;
/// Most body bytes read and thrown away to end a request cleanly.
const DRAIN_CAP: u64 = 64 * 1024 * 1024;

/// Simple case-insensitive header map (keys lowercased)
pub(crate) type HeaderMap = HashMap<String, String>;

/// Request line and headers, plus any body bytes read past the header end.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    /// As sent (not case-normalized).
    pub method: String,
    /// Raw request target: origin-form path or absolute URL.
    pub target: String,
    pub path_lc: String,
    pub headers: HeaderMap,
    leftover: Vec<u8>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }
}

/// Return the index just past the header terminator (CRLFCRLF or LFLF).
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn read_request_head<R: Read>(reader: &mut R) -> io::Result<RequestHead> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let mut header_end: Option<usize> = None;

    while header_end.is_none() && buf.len() < HDR_CAP {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        header_end = find_header_end(&buf);
    }
    let end = header_end.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "incomplete request head (no terminator within cap)",
        )
    })?;

    let header_str = String::from_utf8_lossy(&buf[..end]);
    let mut lines = header_str.lines();
    let request_line = lines.next().unwrap_or_default().trim().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    if method.is_empty() || target.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed request line: '{request_line}'"),
        ));
    }
    let path_lc = path_of_target(&target).to_ascii_lowercase();

    Ok(RequestHead {
        method,
        target,
        path_lc,
        headers: parse_headers(lines),
        leftover: buf[end..].to_vec(),
    })
}

fn path_of_target(target: &str) -> &str {
    let no_query = target.split('?').next().unwrap_or(target);
    match no_query.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => no_query,
    }
}

fn parse_headers<'a, I: Iterator<Item = &'a str>>(lines: I) -> HeaderMap {
    let mut map = HeaderMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            map.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    map
}

fn content_length(head: &RequestHead) -> io::Result<Option<u64>> {
    match head.header("content-length") {
        Some(v) => v.trim().parse::<u64>().map(Some).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad content-length '{v}'"))
        }),
        None => Ok(None),
    }
}

fn is_chunked(head: &RequestHead) -> bool {
    head.header("transfer-encoding")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .contains("chunked")
}

/// Read the request body as a list of chunks.
///
/// - `Transfer-Encoding: chunked`: one entry per wire chunk
/// - `Content-Length`: one entry (empty list for a zero length)
/// - neither: whatever already arrived with the head
///
/// Only `BODY_CAP` bytes are kept. The rest of a framed body is still read
/// off the wire (up to `DRAIN_CAP`) so the peer sees a clean close.
pub(crate) fn read_body_chunks<R: Read>(
    reader: &mut R,
    head: &RequestHead,
) -> io::Result<Vec<Vec<u8>>> {
    if is_chunked(head) {
        return walk_chunked(reader, head.leftover.clone(), BODY_CAP).map(|(chunks, _)| chunks);
    }

    let mut body = head.leftover.clone();
    match content_length(head)? {
        Some(len) => {
            let keep = len.min(BODY_CAP as u64) as usize;
            let mut consumed = (body.len() as u64).min(len);
            body.truncate(keep);
            let mut tmp = [0u8; 8 * 1024];
            let mut eof = false;
            while body.len() < keep {
                let n = reader.read(&mut tmp)?;
                if n == 0 {
                    eof = true;
                    break;
                }
                consumed += n as u64;
                let take = n.min(keep - body.len());
                body.extend_from_slice(&tmp[..take]);
            }
            let rest = len.saturating_sub(consumed);
            if !eof && rest > 0 && rest <= DRAIN_CAP {
                // The kept prefix is complete; a failed drain only costs the peer a reset.
                if let Err(e) = skip_bytes(reader, &mut Vec::new(), rest) {
                    tracing::debug!(error = %e, rest, "body drain stopped early");
                }
            }
        }
        None => body.truncate(BODY_CAP),
    }
    if body.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![body])
    }
}

/// Read a request body off the wire without keeping any of it. Returns the
/// number of body bytes discarded.
pub(crate) fn discard_body<R: Read>(reader: &mut R, head: &RequestHead) -> io::Result<u64> {
    if is_chunked(head) {
        return walk_chunked(reader, head.leftover.clone(), 0).map(|(_, total)| total);
    }
    match content_length(head)? {
        Some(len) if len > DRAIN_CAP => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("body of {len} bytes exceeds drain cap"),
        )),
        Some(len) => {
            let mut rbuf = head.leftover.clone();
            skip_bytes(reader, &mut rbuf, len)?;
            Ok(len)
        }
        None => Ok(0),
    }
}

/// Consume `n` bytes: first from `rbuf`, then straight from `reader` into a sink.
fn skip_bytes<R: Read>(reader: &mut R, rbuf: &mut Vec<u8>, n: u64) -> io::Result<()> {
    let from_buf = n.min(rbuf.len() as u64) as usize;
    rbuf.drain(..from_buf);
    let rest = n - from_buf as u64;
    if rest == 0 {
        return Ok(());
    }
    let copied = io::copy(&mut reader.by_ref().take(rest), &mut io::sink())?;
    if copied < rest {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "body ended before its declared length",
        ));
    }
    Ok(())
}

/// Read from `reader` into `rbuf` until it holds a full line; return the line
/// without its terminator. `None` at EOF.
fn read_line_from<R: Read>(reader: &mut R, rbuf: &mut Vec<u8>) -> io::Result<Option<String>> {
    loop {
        if let Some(pos) = rbuf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = rbuf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        let mut tmp = [0u8; 1024];
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            return Ok(None);
        }
        rbuf.extend_from_slice(&tmp[..n]);
    }
}

fn fill_to<R: Read>(reader: &mut R, rbuf: &mut Vec<u8>, want: usize) -> io::Result<()> {
    let mut tmp = [0u8; 8 * 1024];
    while rbuf.len() < want {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body ended inside a chunk",
            ));
        }
        rbuf.extend_from_slice(&tmp[..n]);
    }
    Ok(())
}

/// Walk a chunked body to its terminator. Chunks are kept while they fit in
/// `keep_cap`; later ones are skipped. Returns the kept chunks and the total
/// payload size; past `DRAIN_CAP` the walk fails.
fn walk_chunked<R: Read>(
    reader: &mut R,
    mut rbuf: Vec<u8>,
    keep_cap: usize,
) -> io::Result<(Vec<Vec<u8>>, u64)> {
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut kept = 0usize;
    let mut total = 0u64;
    loop {
        let line = match read_line_from(reader, &mut rbuf)? {
            Some(l) => l,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Chunk size is hex; extensions after ';' are ignored.
        let size_hex = line.split(';').next().unwrap_or(line).trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad chunk size '{size_hex}'"))
        })?;
        if size == 0 {
            // Trailers until blank line; best-effort.
            while let Some(tr) = read_line_from(reader, &mut rbuf)? {
                if tr.trim().is_empty() {
                    break;
                }
            }
            break;
        }
        total = total.saturating_add(size as u64);
        if total > DRAIN_CAP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunked body exceeds drain cap",
            ));
        }
        if size <= keep_cap - kept {
            fill_to(reader, &mut rbuf, size)?;
            chunks.push(rbuf.drain(..size).collect());
            kept += size;
        } else {
            skip_bytes(reader, &mut rbuf, size as u64)?;
        }
        // CRLF after the chunk payload
        fill_to(reader, &mut rbuf, 1)?;
        if rbuf.starts_with(b"\r") {
            fill_to(reader, &mut rbuf, 2)?;
            if rbuf.starts_with(b"\r\n") {
                rbuf.drain(..2);
            }
        } else if rbuf.starts_with(b"\n") {
            rbuf.drain(..1);
        }
    }
    Ok((chunks, total))
}

/// Parsed HTTP response as seen by the client side.
#[derive(Debug, Clone)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Parse a complete `Connection: close` response buffer.
pub(crate) fn parse_response(buf: &[u8]) -> io::Result<HttpResponse> {
    let end = find_header_end(buf).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "response has no header terminator")
    })?;
    let header_str = String::from_utf8_lossy(&buf[..end]);
    let mut lines = header_str.lines();
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad status line '{status_line}'"),
            )
        })?;
    let headers = parse_headers(lines);
    let mut body = buf[end..].to_vec();
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        body.truncate(len);
    }
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
