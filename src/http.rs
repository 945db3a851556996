use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::ProxyError;

/// Largest accepted header section, delimiter included.
pub const MAX_HEADER_BYTES: usize = 8192;
/// Per-operation timeout on the client socket.
pub const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(7);

const HEADER_END: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 1024;

/// One client request, parsed just far enough to route it.
///
/// `raw` keeps every byte read while framing, so any body bytes that arrived
/// in the same chunks travel along with the headers. An empty `host` means
/// no usable `Host` header was found and the request cannot be routed.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub host: String,
    pub port: String,
    pub raw: Vec<u8>,
}

/// Reads from `stream` until the blank line that ends the header section.
///
/// Returns everything read so far. A stream that closes, errors, or stalls
/// before the delimiter fails with `ConnectionClosed`; one that exceeds
/// [`MAX_HEADER_BYTES`] first fails with `HeaderTooLarge`. Pure framing: the
/// bytes are not interpreted.
pub async fn read_header_block<R>(stream: &mut R) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut block = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match timeout(CLIENT_IO_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => return Err(ProxyError::ConnectionClosed),
        };
        block.extend_from_slice(&chunk[..n]);
        if find(&block, HEADER_END).is_some() {
            return Ok(block);
        }
        // Delimiter first: a block that completes in the chunk that crosses
        // the cap is still accepted.
        if block.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::HeaderTooLarge);
        }
    }
}

/// Best-effort extraction of the request line and `Host` header.
///
/// Never fails; malformed input leaves fields empty. The request line is
/// split on whitespace runs, the first `Host` header (matched
/// case-insensitively) supplies host and port, and the port defaults to
/// `"80"` when the value carries no colon.
pub fn parse(block: &[u8]) -> ParsedRequest {
    let mut req = ParsedRequest {
        method: String::new(),
        path: String::new(),
        version: String::new(),
        host: String::new(),
        port: "80".to_string(),
        raw: block.to_vec(),
    };

    let text = String::from_utf8_lossy(block);
    let Some(first_line_end) = text.find("\r\n") else {
        return req;
    };
    let mut parts = text[..first_line_end].split_whitespace();
    req.method = parts.next().unwrap_or_default().to_string();
    req.path = parts.next().unwrap_or_default().to_string();
    req.version = parts.next().unwrap_or_default().to_string();

    for line in text[first_line_end + 2..].split("\r\n") {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            match value.trim().split_once(':') {
                Some((host, port)) => {
                    req.host = host.to_string();
                    req.port = port.to_string();
                }
                None => req.host = value.trim().to_string(),
            }
            break;
        }
    }
    req
}

/// Rebuilds the outbound request from a parsed one.
///
/// The request line is reassembled from its parsed tokens; any `Connection`
/// or `Proxy-Connection` header value in the section that follows is forced
/// to `close` so the origin drops the connection after one response.
/// Requests that never carried such a header are passed through untouched
/// rather than having one injected. Bytes after the blank line are copied
/// verbatim.
pub fn rewrite(req: &ParsedRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(req.raw.len() + 2);
    out.extend_from_slice(req.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.path.as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.version.as_bytes());
    out.extend_from_slice(b"\r\n");

    let (section, tail) = match find(&req.raw, HEADER_END) {
        Some(i) => (&req.raw[..i], &req.raw[i + HEADER_END.len()..]),
        None => (&req.raw[..], &[][..]),
    };
    let headers = match find(section, b"\r\n") {
        Some(i) => &section[i + 2..],
        None => &[][..],
    };

    if !headers.is_empty() {
        for line in headers.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            match connection_header_name(line) {
                Some(name) => {
                    out.extend_from_slice(name);
                    out.extend_from_slice(b": close\r\n");
                }
                None => {
                    out.extend_from_slice(line);
                    out.extend_from_slice(b"\r\n");
                }
            }
        }
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(tail);
    out
}

/// Returns the header name when `line` is a `Connection` or
/// `Proxy-Connection` header.
fn connection_header_name(line: &[u8]) -> Option<&[u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = trim_ascii(&line[..colon]);
    if name.eq_ignore_ascii_case(b"connection") || name.eq_ignore_ascii_case(b"proxy-connection") {
        Some(&line[..colon])
    } else {
        None
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
