//! HTTP-over-stream tunnel.
//!
//! One tunneled request per stream, no multiplexing, no keep-alive:
//! the client writes a serialized HTTP request onto a fresh tunnel stream
//! and half-closes; the host replays the request against the real network
//! and writes the serialized response back before closing.
//!
//! Scheme heuristic (preserved exactly): the target is `https` only when
//! the `Host` header's port component is literally `443`, else `http`.

use std::sync::Arc;

use futures::prelude::*;
use orcanet_core::{OrcanetError, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cap on request/status line + headers.
const MAX_HEAD: usize = 64 * 1024;

/// Whether the message being read frames its body like a request or a
/// response. Requests without `Content-Length` have no body; responses
/// without one run until the peer closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Parsed HTTP/1.1 message head: start line plus headers, order preserved.
#[derive(Debug, Clone)]
pub struct HttpHead {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Replace a header (or add it) keeping the rest intact.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.start_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read one full HTTP message (head + body) per HTTP's own length rules.
pub async fn read_http_message<R: AsyncRead + Unpin>(
    io: &mut R,
    kind: MessageKind,
) -> Result<(HttpHead, Vec<u8>)> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEAD {
            return Err(OrcanetError::Protocol("http head too large".into()));
        }
        let n = io
            .read(&mut chunk)
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(OrcanetError::Protocol("stream closed inside http head".into()));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = parse_head(&buffer[..head_end])?;
    let mut body = buffer[head_end + 4..].to_vec();

    if head.is_chunked() {
        if kind == MessageKind::Request {
            return Err(OrcanetError::Protocol("chunked requests not supported".into()));
        }
        // Chunked response: the exchange is connection-per-request, so the
        // peer's close delimits the body; relay the raw framing verbatim.
        io.read_to_end(&mut body)
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        return Ok((head, body));
    }

    match head.content_length() {
        Some(length) => {
            let length = length as usize;
            if body.len() > length {
                return Err(OrcanetError::Protocol("body longer than content-length".into()));
            }
            while body.len() < length {
                let n = io
                    .read(&mut chunk)
                    .await
                    .map_err(|e| OrcanetError::Transport(e.to_string()))?;
                if n == 0 {
                    return Err(OrcanetError::Protocol("stream closed inside http body".into()));
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(length);
        }
        None => {
            if kind == MessageKind::Response {
                io.read_to_end(&mut body)
                    .await
                    .map_err(|e| OrcanetError::Transport(e.to_string()))?;
            }
            // Requests without a length have no body.
        }
    }
    Ok((head, body))
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(bytes: &[u8]) -> Result<HttpHead> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| OrcanetError::Protocol("http head is not utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| OrcanetError::Protocol("empty http head".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| OrcanetError::Protocol(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(HttpHead { start_line, headers })
}

/// Scheme for a `Host` header value: `https` only when the port component
/// is literally `443`.
pub fn scheme_for_target(host: &str) -> &'static str {
    match host.rsplit_once(':') {
        Some((_, "443")) => "https",
        _ => "http",
    }
}

/// (host, port, scheme) derived from the request's `Host` header.
pub fn target_from_head(head: &HttpHead) -> Result<(String, u16, &'static str)> {
    let host_header = head
        .header("host")
        .ok_or_else(|| OrcanetError::Protocol("request has no Host header".into()))?;
    let scheme = scheme_for_target(host_header);
    let (host, port) = match host_header.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| OrcanetError::Protocol(format!("bad port in Host: {host_header}")))?,
        ),
        None => (host_header.to_string(), 80),
    };
    Ok((host, port, scheme))
}

/// Rewrite the request for origin delivery: absolute-form targets become
/// origin-form, and the connection is forced closed so EOF delimits the
/// response.
fn prepare_egress_request(head: &HttpHead) -> Result<HttpHead> {
    let mut parts = head.start_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| OrcanetError::Protocol("empty request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| OrcanetError::Protocol("request line has no target".into()))?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    let origin_form = if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        match rest.find('/') {
            Some(pos) => &rest[pos..],
            None => "/",
        }
    } else {
        target
    };

    let mut egress = head.clone();
    egress.start_line = format!("{method} {origin_form} {version}");
    egress.set_header("Connection", "close");
    egress.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("proxy-connection"));
    Ok(egress)
}

/// Issue the request against the real network and return the serialized
/// response (head + body).
pub async fn fetch_origin(head: &HttpHead, body: &[u8]) -> Result<Vec<u8>> {
    let (host, port, scheme) = target_from_head(head)?;
    let egress = prepare_egress_request(head)?;
    let mut request_bytes = egress.serialize();
    request_bytes.extend_from_slice(body);

    debug!(%host, port, scheme, "tunnel egress");
    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| OrcanetError::Transport(format!("connect {host}:{port}: {e}")))?;

    let (response_head, response_body) = if scheme == "https" {
        let connector = tls_connector();
        let server_name = rustls::ServerName::try_from(host.as_str())
            .map_err(|_| OrcanetError::Protocol(format!("invalid tls server name: {host}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| OrcanetError::Transport(format!("tls handshake {host}: {e}")))?;
        exchange(tls.compat(), &request_bytes).await?
    } else {
        exchange(tcp.compat(), &request_bytes).await?
    };

    let mut response = response_head.serialize();
    response.extend_from_slice(&response_body);
    Ok(response)
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    request: &[u8],
) -> Result<(HttpHead, Vec<u8>)> {
    stream
        .write_all(request)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    read_http_message(&mut stream, MessageKind::Response).await
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Host side of one tunnel stream: read the request, replay it against
/// the real network, stream the response back, close. Returns the served
/// request line. Errors propagate to the caller, which drops the stream
/// (abrupt close, no retry).
pub async fn host_serve<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> Result<String> {
    let (head, body) = read_http_message(&mut stream, MessageKind::Request).await?;
    info!(request = %head.start_line, "tunnel request");
    let response = fetch_origin(&head, &body).await?;
    stream
        .write_all(&response)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    stream
        .close()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    Ok(head.start_line)
}

/// A bidirectional byte stream usable as one tunnel exchange.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for S {}

/// Opens a fresh tunnel stream to the chosen host peer, dialed through
/// the relay-encapsulated address. One stream per request.
#[async_trait::async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn open_tunnel(&self) -> Result<Box<dyn TunnelStream>>;
}

/// Client side of one tunnel exchange: write the request, half-close to
/// signal end-of-request, read the full response.
pub async fn tunnel_roundtrip<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    request: &[u8],
) -> Result<Vec<u8>> {
    stream
        .write_all(request)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    stream
        .close()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    Ok(response)
}

/// Local HTTP listener for the tunnel client: every inbound local request
/// is serialized, sent over a freshly dialed tunnel stream, and the
/// response is replayed onto the local socket.
pub async fn run_client_listener(
    listener: TcpListener,
    dialer: Arc<dyn TunnelDialer>,
    cancel: CancellationToken,
) {
    info!(addr = ?listener.local_addr().ok(), "tunnel client listening");
    loop {
        let (socket, remote) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("tunnel client listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("tunnel client accept failed: {e}");
                    continue;
                }
            },
        };
        let dialer = dialer.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_local_request(socket, dialer).await {
                warn!(%remote, "tunneled request failed: {e}");
            }
        });
    }
}

async fn relay_local_request(socket: TcpStream, dialer: Arc<dyn TunnelDialer>) -> Result<()> {
    let mut local = socket.compat();
    let (head, body) = read_http_message(&mut local, MessageKind::Request).await?;
    let mut request = head.serialize();
    request.extend_from_slice(&body);

    let tunnel = dialer.open_tunnel().await?;
    let response = tunnel_roundtrip(tunnel, &request).await?;

    local
        .write_all(&response)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    local
        .close()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as TokioRead, AsyncWriteExt as TokioWrite};

    fn get_request(host: &str) -> Vec<u8> {
        format!("GET /hello HTTP/1.1\r\nHost: {host}\r\nAccept: */*\r\n\r\n").into_bytes()
    }

    #[test]
    fn test_scheme_heuristic_is_literal_443() {
        assert_eq!(scheme_for_target("example.com:443"), "https");
        assert_eq!(scheme_for_target("example.com:8443"), "http");
        assert_eq!(scheme_for_target("example.com:80"), "http");
        assert_eq!(scheme_for_target("example.com"), "http");
    }

    #[test]
    fn test_target_from_head() {
        let head = parse_head(b"GET / HTTP/1.1\r\nHost: example.com:8080").unwrap();
        assert_eq!(target_from_head(&head).unwrap(), ("example.com".into(), 8080, "http"));

        let head = parse_head(b"GET / HTTP/1.1\r\nHost: secure.example:443").unwrap();
        assert_eq!(
            target_from_head(&head).unwrap(),
            ("secure.example".into(), 443, "https")
        );

        let head = parse_head(b"GET / HTTP/1.1\r\nAccept: */*").unwrap();
        assert!(target_from_head(&head).is_err());
    }

    #[test]
    fn test_prepare_egress_normalizes_absolute_form() {
        let head =
            parse_head(b"GET http://example.com/a/b?q=1 HTTP/1.1\r\nHost: example.com").unwrap();
        let egress = prepare_egress_request(&head).unwrap();
        assert_eq!(egress.start_line, "GET /a/b?q=1 HTTP/1.1");
        assert_eq!(egress.header("connection"), Some("close"));
    }

    #[tokio::test]
    async fn test_read_request_with_content_length() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nbody";
        let mut cursor = futures::io::Cursor::new(raw.to_vec());
        let (head, body) = read_http_message(&mut cursor, MessageKind::Request).await.unwrap();
        assert_eq!(head.start_line, "POST /submit HTTP/1.1");
        assert_eq!(body, b"body");
    }

    #[tokio::test]
    async fn test_read_request_without_length_has_no_body() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut cursor = futures::io::Cursor::new(raw.to_vec());
        let (_, body) = read_http_message(&mut cursor, MessageKind::Request).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_read_response_without_length_runs_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: t\r\n\r\nstreaming until close";
        let mut cursor = futures::io::Cursor::new(raw.to_vec());
        let (head, body) = read_http_message(&mut cursor, MessageKind::Response).await.unwrap();
        assert_eq!(head.start_line, "HTTP/1.1 200 OK");
        assert_eq!(body, b"streaming until close");
    }

    #[tokio::test]
    async fn test_chunked_request_rejected() {
        let raw =
            b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n";
        let mut cursor = futures::io::Cursor::new(raw.to_vec());
        let result = read_http_message(&mut cursor, MessageKind::Request).await;
        assert!(matches!(result, Err(OrcanetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_head_serialize_roundtrip() {
        let raw = b"GET /x HTTP/1.1\r\nHost: h\r\nX-Two: b\r\n\r\n";
        let mut cursor = futures::io::Cursor::new(raw.to_vec());
        let (head, _) = read_http_message(&mut cursor, MessageKind::Request).await.unwrap();
        assert_eq!(head.serialize(), raw.to_vec());
    }

    /// Local origin server answering one connection with a fixed body.
    async fn spawn_origin(body: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4096];
            let _ = socket.read(&mut buffer).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_host_serve_end_to_end() {
        let port = spawn_origin("tunneled hello").await;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = client.compat();
        let server = server.compat();

        let host_task = tokio::spawn(async move { host_serve(server).await });

        let request = get_request(&format!("127.0.0.1:{port}"));
        client.write_all(&request).await.unwrap();
        client.close().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        host_task.await.unwrap().unwrap();

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("tunneled hello"));
    }

    #[tokio::test]
    async fn test_client_listener_relays_through_dialer() {
        let origin_port = spawn_origin("via tunnel").await;

        // Dialer whose "tunnel stream" is served in-process by host_serve.
        struct LoopbackDialer;

        #[async_trait::async_trait]
        impl TunnelDialer for LoopbackDialer {
            async fn open_tunnel(&self) -> Result<Box<dyn TunnelStream>> {
                let (near, far) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let _ = host_serve(far.compat()).await;
                });
                Ok(Box::new(near.compat()))
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let loop_task = tokio::spawn(run_client_listener(
            listener,
            Arc::new(LoopbackDialer),
            cancel.clone(),
        ));

        let mut socket = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        socket
            .write_all(&get_request(&format!("127.0.0.1:{origin_port}")))
            .await
            .unwrap();
        let mut response = Vec::new();
        socket.read_to_end(&mut response).await.unwrap();

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("via tunnel"));

        cancel.cancel();
        loop_task.await.unwrap();
    }
}
