//! Per-route reverse proxy
//!
//! Each route owns one pre-configured proxy: the backend URL is parsed once
//! at startup, the pooled transport is built once, and request handlers only
//! rewrite and forward. The outgoing Host header is always rewritten to the
//! backend host: the inbound Host is the overlay service FQDN, and many
//! backends (virtual hosts, ingress controllers, CDNs) route on Host.

use crate::config::Config;
use crate::error::{bad_gateway, BoxError, ProxyBody, ProxyErrorCode};
use crate::transport::{ProxyClient, TransportFactory};
use anyhow::Context;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Bound on waiting for the backend's response headers
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers are a property of the inbound connection and must not
/// be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A pre-configured proxy for a single route. Read-only after construction
/// and safe for concurrent use; the pooled client carries the only internal
/// synchronization.
#[derive(Debug)]
pub struct RouteProxy {
    name: String,
    backend: String,
    target: Uri,
    authority: String,
    client: ProxyClient,
    tls: Arc<rustls::ClientConfig>,
    request_timeout: Option<Duration>,
}

impl RouteProxy {
    pub fn new(
        name: &str,
        backend_url: &str,
        config: &Config,
        factory: &TransportFactory,
    ) -> anyhow::Result<Self> {
        if !backend_url.starts_with("http://") && !backend_url.starts_with("https://") {
            anyhow::bail!(
                "route {}: backend URL must start with http:// or https://",
                name
            );
        }

        let target: Uri = backend_url
            .parse()
            .with_context(|| format!("route {}: parse backend URL {}", name, backend_url))?;
        let authority = target
            .authority()
            .with_context(|| format!("route {}: backend URL has no host", name))?
            .to_string();

        Ok(Self {
            name: name.to_string(),
            backend: backend_url.to_string(),
            client: factory.client(&target),
            tls: factory.tls_client_config(),
            target,
            authority,
            request_timeout: config.request_timeout(),
        })
    }

    /// The parsed backend target
    pub fn target(&self) -> &Uri {
        &self.target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve one inbound request. Never fails: upstream errors become 502
    /// responses, and the request is always accounted for in the log.
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let start = Instant::now();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let inbound_host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let log = RequestLog {
            route: self.name.clone(),
            backend: self.backend.clone(),
            method: req.method().to_string(),
            host: inbound_host.clone(),
            // Query strings may carry secrets; only the path is logged.
            path: req.uri().path().to_string(),
            remote: remote.to_string(),
            request_id: request_id.clone(),
            start,
        };

        let deadline = self.request_timeout.map(|t| start + t);

        let response = if is_upgrade_request(&req) {
            Arc::clone(&self)
                .handle_upgrade(req, &request_id, &inbound_host)
                .await
        } else {
            self.forward(req, remote, &request_id, &inbound_host, deadline)
                .await
        };

        let (parts, body) = response.into_parts();
        let body = RecordingBody::new(body, log, parts.status.as_u16(), deadline);
        Response::from_parts(parts, body.boxed())
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        request_id: &str,
        inbound_host: &str,
        deadline: Option<Instant>,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let outgoing = match self.build_backend_request(req, remote, request_id, inbound_host) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    error = %e,
                    route = %self.name,
                    backend = %self.backend,
                    method = %method,
                    path = %path,
                    "Proxy error"
                );
                return bad_gateway(ProxyErrorCode::UpstreamFailed);
            }
        };

        // The header wait is bounded even when no per-request deadline is
        // configured; an earlier per-request deadline tightens it.
        let now = Instant::now();
        let header_bound = match deadline {
            Some(d) => RESPONSE_HEADER_TIMEOUT.min(d.saturating_duration_since(now)),
            None => RESPONSE_HEADER_TIMEOUT,
        };

        match tokio::time::timeout(header_bound, self.client.request(outgoing)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.map_err(|e| Box::new(e) as BoxError).boxed())
            }
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    route = %self.name,
                    backend = %self.backend,
                    method = %method,
                    path = %path,
                    "Proxy error"
                );
                bad_gateway(ProxyErrorCode::UpstreamFailed)
            }
            Err(_) => {
                warn!(
                    route = %self.name,
                    backend = %self.backend,
                    method = %method,
                    path = %path,
                    timeout_secs = header_bound.as_secs(),
                    "Proxy error: upstream timed out"
                );
                bad_gateway(ProxyErrorCode::UpstreamTimeout)
            }
        }
    }

    /// Rewrite an inbound request for the backend: target scheme/authority,
    /// joined path, Host set to the backend host, hop-by-hop headers
    /// stripped, forwarding headers overwritten (this proxy is the first
    /// trusted hop, so client-supplied values are not appended to).
    fn build_backend_request(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        request_id: &str,
        inbound_host: &str,
    ) -> anyhow::Result<Request<Incoming>> {
        let (mut parts, body) = req.into_parts();

        let path = join_paths(self.target.path(), parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };

        let uri = Uri::builder()
            .scheme(self.target.scheme_str().unwrap_or("http"))
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .context("build backend URI")?;
        parts.uri = uri;

        for name in HOP_BY_HOP_HEADERS {
            parts.headers.remove(name);
        }

        parts.headers.insert(
            hyper::header::HOST,
            HeaderValue::from_str(&self.authority).context("backend host header")?,
        );
        if let Ok(value) = HeaderValue::from_str(request_id) {
            parts.headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&remote.ip().to_string()) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(inbound_host) {
            parts.headers.insert(X_FORWARDED_HOST, value);
        }
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        Ok(Request::from_parts(parts, body))
    }

    /// Forward a protocol upgrade (WebSocket etc.) over a raw backend
    /// connection: send the upgrade request, relay the 101, then copy bytes
    /// bidirectionally until either side closes.
    async fn handle_upgrade(
        self: Arc<Self>,
        req: Request<Incoming>,
        request_id: &str,
        inbound_host: &str,
    ) -> Response<ProxyBody> {
        debug!(
            route = %self.name,
            request_id,
            upgrade = %upgrade_type(&req).unwrap_or_default(),
            "Handling upgrade request"
        );

        let mut backend = match self.dial_backend().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    error = %e,
                    route = %self.name,
                    backend = %self.backend,
                    "Proxy error: upgrade dial failed"
                );
                return bad_gateway(ProxyErrorCode::UpstreamFailed);
            }
        };

        let raw_request = self.build_upgrade_request(&req, request_id, inbound_host);
        if let Err(e) = backend.write_all(&raw_request).await {
            warn!(error = %e, route = %self.name, "Proxy error: failed to send upgrade request");
            return bad_gateway(ProxyErrorCode::UpstreamFailed);
        }

        let (head, leftover) = match read_response_head(&mut backend).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, route = %self.name, "Proxy error: failed to read upgrade response");
                return bad_gateway(ProxyErrorCode::UpstreamFailed);
            }
        };

        let (status, response_headers) = match parse_response_head(&head) {
            Some(parsed) => parsed,
            None => {
                warn!(route = %self.name, "Proxy error: invalid upgrade response from backend");
                return bad_gateway(ProxyErrorCode::UpstreamFailed);
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(route = %self.name, status = %status, "Backend declined upgrade");
            return relay_response_head(status, &response_headers);
        }

        let response = relay_response_head(status, &response_headers);

        let proxy = Arc::clone(&self);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    proxy
                        .tunnel(upgraded, backend, leftover, &request_id)
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, route = %proxy.name, request_id = %request_id, "Client upgrade failed");
                }
            }
        });

        response
    }

    async fn tunnel(
        &self,
        client: Upgraded,
        mut backend: Box<dyn Io>,
        leftover: Vec<u8>,
        request_id: &str,
    ) {
        let mut client_io = TokioIo::new(client);

        // Bytes the backend sent immediately after the 101 head belong to
        // the upgraded stream.
        if !leftover.is_empty() {
            if let Err(e) = client_io.write_all(&leftover).await {
                debug!(error = %e, route = %self.name, request_id, "Tunnel closed writing early bytes");
                return;
            }
        }

        match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
            Ok((to_backend, to_client)) => {
                debug!(
                    route = %self.name,
                    request_id,
                    to_backend,
                    to_client,
                    "Upgraded connection closed"
                );
            }
            Err(e) => {
                debug!(error = %e, route = %self.name, request_id, "Upgraded connection closed with error");
            }
        }
    }

    async fn dial_backend(&self) -> anyhow::Result<Box<dyn Io>> {
        let host = self.target.host().context("backend URL has no host")?;
        let is_tls = self.target.scheme_str() == Some("https");
        let port = self
            .target
            .port_u16()
            .unwrap_or(if is_tls { 443 } else { 80 });

        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connect {}:{}", host, port))?;

        if !is_tls {
            return Ok(Box::new(stream));
        }

        let server_name =
            ServerName::try_from(host.to_string()).context("invalid backend host for TLS")?;
        let tls_stream = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, stream)
            .await
            .context("backend TLS handshake")?;
        Ok(Box::new(tls_stream))
    }

    fn build_upgrade_request(
        &self,
        req: &Request<Incoming>,
        request_id: &str,
        inbound_host: &str,
    ) -> Vec<u8> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);

        for (name, value) in req.headers() {
            if name == &hyper::header::HOST || name.as_str() == X_REQUEST_ID {
                continue;
            }
            if let Ok(v) = value.to_str() {
                raw.push_str(&format!("{}: {}\r\n", name, v));
            }
        }

        raw.push_str(&format!("Host: {}\r\n", self.authority));
        raw.push_str(&format!("{}: {}\r\n", X_REQUEST_ID, request_id));
        if !inbound_host.is_empty() {
            raw.push_str(&format!("{}: {}\r\n", X_FORWARDED_HOST, inbound_host));
        }
        raw.push_str("\r\n");

        raw.into_bytes()
    }
}

/// Stream to a backend for upgrade tunnelling, plain or TLS
trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Check if a request is asking for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
}

/// Read the backend's response head, returning the head bytes and any bytes
/// read past the terminating blank line
async fn read_response_head(stream: &mut Box<dyn Io>) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    const MAX_HEAD: usize = 16 * 1024;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("backend closed connection before responding");
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            anyhow::bail!("backend response head exceeds {} bytes", MAX_HEAD);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a response head: status line plus headers
fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Build the response relayed to the client from a parsed backend head
fn relay_response_head(status: StatusCode, headers: &[(String, String)]) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), v);
        }
    }

    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| bad_gateway(ProxyErrorCode::UpstreamFailed))
}

/// Join a target path prefix with the inbound request path, avoiding both
/// doubled and missing slashes
fn join_paths(base: &str, path: &str) -> String {
    if base.is_empty() || base == "/" {
        return path.to_string();
    }
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Context for the per-request log line
struct RequestLog {
    route: String,
    backend: String,
    method: String,
    host: String,
    path: String,
    remote: String,
    request_id: String,
    start: Instant,
}

/// Response-body wrapper that accounts for status, bytes written, and
/// duration, emitting the request log line exactly once when the body
/// completes (or is dropped early by a disconnecting client). An optional
/// deadline cuts off streaming when the per-request timeout expires.
struct RecordingBody {
    inner: ProxyBody,
    log: Option<RequestLog>,
    status: u16,
    bytes: u64,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl RecordingBody {
    fn new(inner: ProxyBody, log: RequestLog, status: u16, deadline: Option<Instant>) -> Self {
        Self {
            inner,
            log: Some(log),
            status,
            bytes: 0,
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d.into()))),
        }
    }

    fn finish(&mut self) {
        let Some(log) = self.log.take() else {
            return;
        };
        info!(
            route = %log.route,
            backend = %log.backend,
            method = %log.method,
            host = %log.host,
            path = %log.path,
            status = self.status,
            bytes = self.bytes,
            duration_ms = log.start.elapsed().as_millis() as u64,
            remote = %log.remote,
            request_id = %log.request_id,
            "request"
        );
    }
}

impl Body for RecordingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.log.is_none() {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.finish();
                return Poll::Ready(Some(Err("request deadline exceeded".into())));
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordingBody {
    fn drop(&mut self) {
        // Client disconnected mid-stream; account for what was written.
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFactory;

    fn test_config() -> Config {
        toml::from_str(
            r#"
routes = ["app=http://127.0.0.1:8080"]

[oauth]
client_id = "id"
client_secret = "secret"
"#,
        )
        .unwrap()
    }

    fn proxy(backend: &str) -> anyhow::Result<RouteProxy> {
        let config = test_config();
        let factory = TransportFactory::from_config(&config);
        RouteProxy::new("app", backend, &config, &factory)
    }

    #[test]
    fn test_rejects_missing_scheme() {
        let err = proxy("127.0.0.1:8080").unwrap_err();
        assert!(err.to_string().contains("http:// or https://"));
    }

    #[test]
    fn test_rejects_malformed_url() {
        assert!(proxy("http://[::1:80/").is_err());
    }

    #[test]
    fn test_parses_target_once() {
        let proxy = proxy("http://127.0.0.1:8080").unwrap();
        assert_eq!(proxy.target().host(), Some("127.0.0.1"));
        assert_eq!(proxy.authority, "127.0.0.1:8080");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/a/b"), "/a/b");
        assert_eq!(join_paths("", "/a"), "/a");
        assert_eq!(join_paths("/api", "/a"), "/api/a");
        assert_eq!(join_paths("/api/", "/a"), "/api/a");
        assert_eq!(join_paths("/api", "a"), "/api/a");
    }

    #[test]
    fn test_parse_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));
    }

    #[test]
    fn test_parse_response_head_rejects_garbage() {
        assert!(parse_response_head(b"not an http response").is_none());
        assert!(parse_response_head(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .header("connection", "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }
}
