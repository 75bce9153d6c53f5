//! Host/Origin validation for locally-bound servers.
//!
//! A server listening on loopback is still reachable from a hostile web page
//! through DNS rebinding: the page's hostname passes the browser's checks,
//! then re-resolves to `127.0.0.1`. The guard closes that hole by refusing
//! any request whose `Host` is not an allow-listed loopback form, and any
//! request carrying an `Origin` that does not itself point at loopback.
//!
//! Matching is exact on the host after stripping the port — `evil.localhost`
//! and `localhost.evil.com` do not pass.

use http::HeaderMap;
use serde_json::json;
use thiserror::Error;
use url::Url;

/// JSON-RPC error code carried in the 403 body.
pub const FORBIDDEN_ERROR_CODE: i32 = -32000;

const LOOPBACK_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "[::1]", "::1"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForbiddenError {
    #[error("Host header is missing")]
    MissingHost,
    #[error("Host header is not an allowed host: {0}")]
    HostNotAllowed(String),
    #[error("Origin header is not an allowed origin: {0}")]
    OriginNotAllowed(String),
}

impl ForbiddenError {
    /// The JSON-RPC-shaped 403 body for this rejection.
    pub fn to_json_body(&self) -> serde_json::Value {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": FORBIDDEN_ERROR_CODE,
                "message": self.to_string(),
            }
        })
    }
}

/// Validates `Host` and `Origin` headers against a loopback allow-list.
#[derive(Debug, Clone)]
pub struct LoopbackGuard {
    allowed: Vec<String>,
}

impl Default for LoopbackGuard {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl LoopbackGuard {
    /// Build a guard accepting the loopback forms plus `extra_hosts`
    /// (compared case-insensitively, without port).
    pub fn new(extra_hosts: impl IntoIterator<Item = String>) -> Self {
        let mut allowed: Vec<String> = LOOPBACK_HOSTS.iter().map(|h| h.to_string()).collect();
        allowed.extend(extra_hosts.into_iter().map(|h| h.to_ascii_lowercase()));
        Self { allowed }
    }

    /// Check one request's headers. `Ok(())` means the request may proceed.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ForbiddenError> {
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or(ForbiddenError::MissingHost)?;
        if !self.host_allowed(host) {
            return Err(ForbiddenError::HostNotAllowed(host.to_owned()));
        }

        // Absent Origin is fine: non-browser clients do not send one.
        if let Some(origin) = headers
            .get(http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
        {
            if !self.origin_allowed(origin) {
                return Err(ForbiddenError::OriginNotAllowed(origin.to_owned()));
            }
        }
        Ok(())
    }

    fn host_allowed(&self, host: &str) -> bool {
        let bare = strip_port(host).to_ascii_lowercase();
        self.allowed.iter().any(|a| *a == bare)
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        let Ok(url) = Url::parse(origin) else {
            return false;
        };
        match url.host_str() {
            Some(host) => {
                // Url normalizes IPv6 hosts to the bracketed form.
                let bare = strip_port(host).to_ascii_lowercase();
                self.allowed.iter().any(|a| *a == bare)
            }
            None => false,
        }
    }
}

/// `host[:port]` → `host`, leaving bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rfind(':') {
            Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
            _ => host,
        }
    }
}
