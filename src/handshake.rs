//! HTTP upgrade handshake (RFC 6455 Section 4), server side.
//!
//! A client opens the connection with a plain HTTP/1.1 request:
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! and the server answers:
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! The last non-empty segment of the request path names the *service*
//! the client wants; the server compares it against its configured
//! service name and answers 400 on mismatch. Subprotocol and extension
//! offers are parsed and stored but never advertised back, since this
//! library negotiates neither.

use std::collections::HashMap;

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::SockError;

/// RFC 6455 GUID for the Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Lowest HTTP version accepted for an upgrade.
const MIN_HTTP_VERSION: (u8, u8) = (1, 1);

/// Compute the Sec-WebSocket-Accept value from a client key.
///
/// Per RFC 6455 Section 4.2.2: concatenate the client's
/// `Sec-WebSocket-Key` with the GUID, SHA-1 hash it, base64 encode.
///
/// # Example
///
/// ```
/// use textsock::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// A parsed and validated client upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// HTTP version as (major, minor); at least 1.1.
    pub http_version: (u8, u8),
    /// Last non-empty segment of the request path.
    pub service: String,
    /// `Host` header value.
    pub host: String,
    /// `Sec-WebSocket-Key` header value.
    pub key: String,
    /// `Origin` header value, if present.
    pub origin: Option<String>,
    /// Subprotocols the client offered (stored, never negotiated).
    pub protocols: Vec<String>,
    /// Extensions the client offered (stored, never negotiated).
    pub extensions: Vec<String>,
}

impl UpgradeRequest {
    /// Parse an upgrade request from its text form.
    ///
    /// Line endings are normalized before parsing, so both CRLF and bare
    /// LF input is accepted. Header lines that are not of the form
    /// `Name: value` with a `[A-Za-z-]+` name are ignored.
    ///
    /// # Errors
    ///
    /// Returns `SockError::DataFormat` when the request line is
    /// malformed, the HTTP version is below 1.1, or any of the required
    /// upgrade headers is missing or carries the wrong value.
    pub fn parse(text: &str) -> Result<Self, SockError> {
        let text = text.replace("\r\n", "\n");
        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| bad("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| bad("missing method"))?;
        if method != "GET" {
            return Err(bad(&format!("method must be GET, got '{method}'")));
        }
        let uri = parts.next().ok_or_else(|| bad("missing request-uri"))?;
        let version_token = parts.next().ok_or_else(|| bad("missing HTTP version"))?;

        let http_version = parse_http_version(version_token)?;
        if http_version < MIN_HTTP_VERSION {
            return Err(bad(&format!(
                "HTTP version {}.{} is below 1.1",
                http_version.0, http_version.1
            )));
        }

        let service = uri
            .split('/')
            .rev()
            .find(|segment| !segment.is_empty())
            .ok_or_else(|| bad("request-uri has no service segment"))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = parse_header_line(line) {
                headers.insert(name, value);
            }
        }

        let host = required_header(&headers, "host")?.to_string();

        let upgrade = required_header(&headers, "upgrade")?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(bad(&format!(
                "Upgrade header must be 'websocket', got '{upgrade}'"
            )));
        }

        let connection = required_header(&headers, "connection")?;
        if !connection.eq_ignore_ascii_case("upgrade") {
            return Err(bad(&format!(
                "Connection header must be 'Upgrade', got '{connection}'"
            )));
        }

        let version = required_header(&headers, "sec-websocket-version")?;
        if version != "13" {
            return Err(bad(&format!(
                "unsupported WebSocket version '{version}'"
            )));
        }

        let key = required_header(&headers, "sec-websocket-key")?.to_string();

        let origin = headers.get("origin").cloned();
        let protocols = split_list(headers.get("sec-websocket-protocol"));
        let extensions = split_list(headers.get("sec-websocket-extensions"));

        Ok(Self {
            http_version,
            service,
            host,
            key,
            origin,
            protocols,
            extensions,
        })
    }
}

fn bad(reason: &str) -> SockError {
    SockError::DataFormat(reason.to_string())
}

fn required_header<'h>(
    headers: &'h HashMap<String, String>,
    name: &str,
) -> Result<&'h str, SockError> {
    headers
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| bad(&format!("missing required header '{name}'")))
}

/// Parses `HTTP/<major>.<minor>` (a missing minor means `.0`).
fn parse_http_version(token: &str) -> Result<(u8, u8), SockError> {
    let digits = token
        .strip_prefix("HTTP/")
        .ok_or_else(|| bad(&format!("malformed HTTP version '{token}'")))?;
    let (major, minor) = match digits.split_once('.') {
        Some((major, minor)) => (major, minor),
        None => (digits, "0"),
    };
    let major: u8 = major
        .parse()
        .map_err(|_| bad(&format!("malformed HTTP version '{token}'")))?;
    let minor: u8 = minor
        .parse()
        .map_err(|_| bad(&format!("malformed HTTP version '{token}'")))?;
    Ok((major, minor))
}

/// Accepts `Name: value` where the name is `[A-Za-z-]+`; anything else is
/// not a header line and is skipped.
fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim_end();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '-')
    {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some((name.to_ascii_lowercase(), value.to_string()))
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// The server's side of a successful handshake: the 101 response.
///
/// No subprotocols or extensions are ever advertised back, so the
/// response carries only the three mandatory upgrade headers.
#[derive(Debug, Clone)]
pub struct AcceptResponse {
    /// HTTP version echoed from the request.
    pub http_version: (u8, u8),
    /// Computed Sec-WebSocket-Accept value.
    pub accept_key: String,
}

impl AcceptResponse {
    /// Builds the 101 response for a validated request.
    #[must_use]
    pub fn for_request(request: &UpgradeRequest) -> Self {
        Self {
            http_version: request.http_version,
            accept_key: compute_accept_key(&request.key),
        }
    }

    /// Serializes the 101 response.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/{}.{} 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            self.http_version.0, self.http_version.1, self.accept_key
        )
        .into_bytes()
    }
}

/// Serializes a 400 rejection, optionally with extra header lines.
#[must_use]
pub fn bad_request(http_version: (u8, u8), extra_headers: &[(&str, &str)]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/{}.{} 400 Bad Request\r\n",
        http_version.0, http_version.1
    );
    for (name, value) in extra_headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.into_bytes()
}
