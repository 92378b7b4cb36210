/*!
Authorization helpers for the tap's control endpoints.

Mirrored traffic is never authenticated; only `/_ctxtap/` paths are, and only when a
token is configured.
*/

use crate::http::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlAuth {
    /// No token configured.
    Open,
    Authorized,
    Denied,
}

/// Return true when an Authorization header value authorizes the given token
/// using the standard Bearer scheme (RFC 6750).
/// Accepts "Bearer <token>" (scheme case-insensitive; at least one ASCII
/// whitespace separating scheme and credentials).
pub fn authorization_value_matches(value: &str, token: &str) -> bool {
    let v = value.trim();
    if let Some(idx) = v.find(|c: char| c.is_ascii_whitespace()) {
        let (scheme, rest) = v.split_at(idx);
        if scheme.eq_ignore_ascii_case("bearer") {
            let cred = rest.trim();
            return !cred.is_empty() && cred == token;
        }
    }
    false
}

pub(crate) fn check_control_auth(headers: &HeaderMap, token: Option<&str>) -> ControlAuth {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return ControlAuth::Open,
    };
    match headers.get("authorization") {
        Some(v) if authorization_value_matches(v, token) => ControlAuth::Authorized,
        _ => ControlAuth::Denied,
    }
}
