//! Request forwarding.
//!
//! Plain requests go through a pooled hyper client with `X-Forwarded-*`
//! headers added. `Upgrade` requests are hijacked: the request head is
//! replayed over a raw TCP connection to the backend and, once both sides
//! agree on 101, bytes are copied in both directions until either closes.

use bytes::Bytes;
use haven_common::{HttpError, REGISTRY};
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::host::Backend;

/// Body type every proxy response shares.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|e: std::convert::Infallible| match e {})
        .boxed_unsync()
}

/// Canonical 500 for upstream failures; counts into `errors`.
pub fn upstream_error(detail: &str) -> Response<ProxyBody> {
    REGISTRY.bump_stat("errors");
    let envelope = HttpError::upstream("upstream failure", detail).envelope();
    Response::builder()
        .status(500)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full(envelope.to_string().into_bytes()))
        .expect("static response builds")
}

pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Forward one request. `tls` marks the listener that accepted it, for
    /// `X-Forwarded-Proto`.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        backend: &Backend,
        client_ip: &str,
        tls: bool,
    ) -> Response<ProxyBody> {
        if is_upgrade(&req) {
            return self.tunnel(req, backend).await;
        }

        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let uri = format!("http://{}{}", backend.addr(), path_and_query);
        match uri.parse() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => return upstream_error(&format!("bad forward uri: {e}")),
        }

        let headers = req.headers_mut();
        if let Ok(value) = client_ip.parse() {
            headers.insert("x-forwarded-for", value);
        }
        if let Ok(value) = host.parse() {
            headers.insert("x-forwarded-host", value);
        }
        headers.insert(
            "x-forwarded-proto",
            http::HeaderValue::from_static(if tls { "https" } else { "http" }),
        );

        match self.client.request(req).await {
            Ok(response) => response.map(BodyExt::boxed_unsync),
            Err(e) => {
                error!(backend = %backend.addr(), error = %e, "forward failed");
                upstream_error(&e.to_string())
            }
        }
    }

    /// WebSocket (or any Upgrade) passthrough over raw TCP.
    async fn tunnel(&self, req: Request<Incoming>, backend: &Backend) -> Response<ProxyBody> {
        let mut upstream = match TcpStream::connect(backend.addr()).await {
            Ok(stream) => stream,
            Err(e) => return upstream_error(&format!("connect: {e}")),
        };

        // Replay the request head verbatim.
        let mut head = format!(
            "{} {} HTTP/1.1\r\n",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        head.push_str("\r\n");
        if let Err(e) = upstream.write_all(head.as_bytes()).await {
            return upstream_error(&format!("upgrade write: {e}"));
        }

        // Read the backend's response head.
        let mut raw = Vec::with_capacity(1024);
        let header_end = loop {
            let mut chunk = [0u8; 1024];
            let n = match upstream.read(&mut chunk).await {
                Ok(0) => return upstream_error("backend closed during upgrade"),
                Ok(n) => n,
                Err(e) => return upstream_error(&format!("upgrade read: {e}")),
            };
            raw.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find(&raw, b"\r\n\r\n") {
                break pos + 4;
            }
            if raw.len() > 16 * 1024 {
                return upstream_error("oversized upgrade response");
            }
        };
        let leftover = raw.split_off(header_end);

        let Some((status, header_lines)) = parse_head(&raw) else {
            return upstream_error("malformed upgrade response");
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in &header_lines {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let Ok(response) = builder.body(full(Bytes::new())) else {
            return upstream_error("malformed upgrade headers");
        };

        if status == 101 {
            let on_upgrade = hyper::upgrade::on(req);
            tokio::spawn(async move {
                let upgraded = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        warn!(error = %e, "client upgrade failed");
                        return;
                    }
                };
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() {
                    if client.write_all(&leftover).await.is_err() {
                        return;
                    }
                }
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((up, down)) => {
                        debug!(up, down, "websocket tunnel closed");
                    }
                    Err(e) => debug!(error = %e, "websocket tunnel ended"),
                }
            });
            info!("websocket upgrade in progress");
        }

        response
    }
}

fn is_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse `HTTP/1.1 <status> …` plus header lines.
fn parse_head(raw: &[u8]) -> Option<(u16, Vec<(String, String)>)> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head_reads_status_and_headers() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_head(raw).unwrap();
        assert_eq!(status, 101);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));
    }

    #[test]
    fn parse_head_rejects_garbage() {
        assert!(parse_head(b"not http at all").is_none());
    }

    #[test]
    fn upstream_error_counts_and_envelopes() {
        let before = REGISTRY.stat("errors");
        let response = upstream_error("connect refused");
        assert_eq!(response.status(), 500);
        assert_eq!(REGISTRY.stat("errors"), before + 1);
    }
}
