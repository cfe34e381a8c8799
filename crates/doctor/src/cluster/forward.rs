//! Scoped port-forward used by the HTTP smoke probe.
//!
//! The forward is held by [`PodForward`]; dropping the handle aborts the
//! underlying websocket task, so the resource is released no matter how the
//! probe step ended.

use async_trait::async_trait;
use kube::api::Portforwarder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cluster::{ForwardHandle, ProbeResponse};
use crate::error::DiagnosticError;

/// Object-safe alias for the forwarded duplex stream.
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// A live port-forward to one pod.
pub struct PodForward {
    forwarder: Portforwarder,
    stream: Option<Box<dyn ForwardStream>>,
    pod: String,
}

impl PodForward {
    pub fn new(
        mut forwarder: Portforwarder,
        pod: String,
        port: u16,
    ) -> Result<Self, DiagnosticError> {
        let stream = forwarder.take_stream(port).ok_or_else(|| {
            DiagnosticError::Probe(format!("port {port} not available on forward to {pod}"))
        })?;
        Ok(Self {
            forwarder,
            stream: Some(Box::new(stream)),
            pod,
        })
    }
}

#[async_trait]
impl ForwardHandle for PodForward {
    async fn http_get(&mut self, path: &str) -> Result<ProbeResponse, DiagnosticError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DiagnosticError::Probe("forward stream already consumed".to_string()))?;

        let request = build_request(path, &self.pod);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| DiagnosticError::Probe(format!("write to forwarded stream: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| DiagnosticError::Probe(format!("flush forwarded stream: {e}")))?;

        // Connection: close makes the server end the stream after one
        // response, so reading to EOF is the whole exchange.
        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| DiagnosticError::Probe(format!("read from forwarded stream: {e}")))?;
        self.stream = None;

        debug!("probe to {} returned {} bytes", self.pod, raw.len());
        parse_response(&raw)
    }
}

impl Drop for PodForward {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn build_request(path: &str, host: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: flux-doctor\r\n\
         Accept: */*\r\n\
         Connection: close\r\n\r\n"
    )
}

/// Minimal HTTP/1.1 response parse: status line plus body after the blank
/// line, with chunked framing stripped. Enough for a single smoke probe;
/// not a general client.
fn parse_response(raw: &[u8]) -> Result<ProbeResponse, DiagnosticError> {
    let (head_bytes, body_bytes) = match find_subslice(raw, b"\r\n\r\n") {
        Some(i) => (&raw[..i], &raw[i + 4..]),
        None => (raw, &[][..]),
    };
    let head = String::from_utf8_lossy(head_bytes);

    let status_line = head.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            DiagnosticError::Probe(format!("malformed HTTP response: {status_line:?}"))
        })?;

    let chunked = head.lines().skip(1).any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("transfer-encoding:") && line.contains("chunked")
    });
    let body = if chunked {
        String::from_utf8_lossy(&decode_chunked(body_bytes)).into_owned()
    } else {
        String::from_utf8_lossy(body_bytes).into_owned()
    };

    Ok(ProbeResponse { status, body })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strip chunked transfer framing. Bails out of malformed framing with
/// whatever was decoded so far; the probe only reports the body.
fn decode_chunked(mut rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let Some(line_end) = find_subslice(rest, b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size_str = size_line.split(';').next().unwrap_or("").trim().to_string();
        let Ok(size) = usize::from_str_radix(&size_str, 16) else {
            break;
        };
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if rest.len() < size {
            out.extend_from_slice(rest);
            break;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size..];
        rest = rest.strip_prefix(b"\r\n".as_slice()).unwrap_or(rest);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_connection_close() {
        let req = build_request("/healthz", "rss-parser-abc");
        assert!(req.starts_with("GET /healthz HTTP/1.1\r\n"));
        assert!(req.contains("Host: rss-parser-abc\r\n"));
        assert!(req.contains("Connection: close\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parse_ok_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhealthy\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "healthy\n");
    }

    #[test]
    fn parse_error_status() {
        let raw = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 503);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn parse_chunked_response_strips_framing() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    7\r\nhealthy\r\n1\r\n\n\r\n0\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "healthy\n");
    }

    #[test]
    fn truncated_chunked_body_keeps_decoded_prefix() {
        let raw = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nff\r\npartial";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.body, "partial");
    }

    #[test]
    fn garbage_is_a_probe_error() {
        assert!(matches!(
            parse_response(b"not http at all"),
            Err(DiagnosticError::Probe(_))
        ));
    }
}
