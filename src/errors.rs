//! Error mapping guide:
//! - Capture failures never leave the observer; they are logged against the request id.
//! - Store failures are logged in the store worker and handed back through the pending reply.
//! - Map io::ErrorKind::NotFound to exit code 127, retrieval failures to 3, all others to 1.
use std::fmt;
use std::io;
use std::time::Duration;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Why one captured request did not yield a context fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// First body chunk absent or empty.
    NoBody,
    /// Body bytes are not valid UTF-8.
    Decode(String),
    /// Body text is not valid JSON.
    Parse(String),
    /// No `context` key, or its value is null.
    FieldMissing,
}

impl CaptureError {
    /// Stable short label used as the `outcome` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::NoBody => "no_body",
            CaptureError::Decode(_) => "decode_error",
            CaptureError::Parse(_) => "parse_error",
            CaptureError::FieldMissing => "field_missing",
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NoBody => write!(f, "request carried no body"),
            CaptureError::Decode(e) => write!(f, "body is not valid utf-8: {e}"),
            CaptureError::Parse(e) => write!(f, "body is not valid json: {e}"),
            CaptureError::FieldMissing => write!(f, "payload has no context field"),
        }
    }
}

impl std::error::Error for CaptureError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Write(String),
    Read(String),
    /// The store worker is gone; no reply will ever arrive.
    Closed,
    Timeout(Duration),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Write(e) => write!(f, "store write failed: {e}"),
            StoreError::Read(e) => write!(f, "store read failed: {e}"),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::Timeout(d) => {
                write!(f, "store did not answer within {}", humantime::format_duration(*d))
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The service accepted the request but did not reply in time.
    Timeout(Duration),
    /// The service is unreachable, went away, or nothing answered the action.
    NoResponse(String),
    /// Malformed message on either side.
    Protocol(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Timeout(d) => {
                write!(f, "no reply within {}", humantime::format_duration(*d))
            }
            ChannelError::NoResponse(e) => write!(f, "no response: {e}"),
            ChannelError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Convert ChannelError to exit code. Retrieval failures get their own code so
/// scripts can tell "service down" from usage errors.
pub fn exit_code_for_channel_error(e: &ChannelError) -> u8 {
    match e {
        ChannelError::Timeout(_) | ChannelError::NoResponse(_) => 3,
        ChannelError::Protocol(_) => 1,
    }
}
