//! Tunnel Handler (spec §4.G): CONNECT (H1 and H2) and Upgrade requests get
//! a raw bidirectional splice rather than a request/response cycle. Ported
//! from `manaflow-ai-manaflow`'s `server.rs::{handle_connect, handle_upgrade,
//! consume_websocket_handshake}`, generalized onto the new
//! `Registry`/`ProxyTarget`/`ProxyError` types; the H2 CONNECT path is new
//! (the teacher only ever serves H1 CONNECT). `handle_upgrade` dials and
//! completes the upstream handshake before ever responding to the client, so
//! a failed dial or a non-101 upstream status reaches the client as 502
//! instead of a 101 that never pans out.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use super::dispatcher::BoxBody;
use super::target::ProxyTarget;
use crate::proxy::telemetry::emit;

pub fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// HTTP/1.1 CONNECT: write `200 Connection Established` then hand the
/// upgraded client socket off to a raw splice against the rewritten target.
pub async fn handle_h1_connect(
    mut req: Request<Incoming>,
    target: ProxyTarget,
) -> Response<BoxBody> {
    let host = target.uri.host().unwrap_or_default().to_string();
    let port = target.connect_port;

    let upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, host = %host, port, "connect-request upstream failed");
            return bad_gateway();
        }
    };

    emit!("connect-request", host = %host, port = port);

    tokio::spawn(async move {
        let mut upstream = upstream;
        match hyper::upgrade::on(&mut req).await {
            Ok(client_upgraded) => {
                let mut client = TokioIo::new(client_upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    tracing::warn!(error = %e, "connect tunnel ended with error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "connect upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap()
}

/// HTTP/1.1 Upgrade (WebSocket and similar): rebuild the request line as raw
/// bytes, connect (TLS if the rewritten target is secure) and complete the
/// upstream handshake *before* telling the client anything, then splice. If
/// the dial or handshake fails, the client gets 502 and never sees 101 — it
/// must never be told the tunnel is up before it actually is.
pub async fn handle_upgrade(
    mut req: Request<Incoming>,
    target: ProxyTarget,
    tls_connector: TlsConnector,
) -> Response<BoxBody> {
    let host = target.uri.host().unwrap_or_default().to_string();
    let port = target.connect_port;
    let use_tls = target.secure;
    let path = target
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let mut upstream_request = Vec::new();
    upstream_request.extend_from_slice(format!("GET {path} HTTP/1.1\r\n").as_bytes());
    upstream_request.extend_from_slice(format_host_header(&host, port, use_tls).as_bytes());

    for (name, value) in req.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "proxy-authorization" || lower == "host" {
            continue;
        }
        upstream_request.extend_from_slice(name.as_str().as_bytes());
        upstream_request.extend_from_slice(b": ");
        upstream_request.extend_from_slice(value.as_bytes());
        upstream_request.extend_from_slice(b"\r\n");
    }
    upstream_request.extend_from_slice(b"\r\n");

    let mut upstream = match connect_upstream_stream(&host, port, use_tls, &tls_connector).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(error = %e, host = %host, port, "upgrade dial failed");
            emit!("upgrade-upstream-error", host = %host, error = %e.to_string());
            return bad_gateway();
        }
    };
    if let Err(e) = upstream.write_all(&upstream_request).await {
        tracing::debug!(error = %e, host = %host, port, "upgrade handshake write failed");
        emit!("upgrade-upstream-error", host = %host, error = %e.to_string());
        return bad_gateway();
    }
    let pending = match consume_websocket_handshake(&mut upstream).await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::debug!(error = %e, host = %host, port, "upgrade handshake rejected");
            emit!("upgrade-upstream-error", host = %host, error = %e.to_string());
            return bad_gateway();
        }
    };

    emit!("upgrade-request", host = %host, port = port);

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(client_upgraded) => {
                let mut client = TokioIo::new(client_upgraded);
                if !pending.is_empty() {
                    if let Err(e) = client.write_all(&pending).await {
                        tracing::debug!(error = %e, "upgrade replay to client failed");
                        emit!("upgrade-upstream-error", host = %host, error = %e.to_string());
                        return;
                    }
                }
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    tracing::warn!(error = %e, "upgrade tunnel ended with error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "upgrade client-side upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("upgrade", "websocket")
        .header("connection", "upgrade")
        .body(empty_body())
        .unwrap()
}

/// HTTP/2 CONNECT: respond `:status=200` then splice the H2 stream against
/// the upstream socket. No teacher precedent — the spec's only H2-specific
/// tunnel requirement.
pub async fn handle_h2_connect(
    target: ProxyTarget,
    mut recv_stream: h2::RecvStream,
    mut respond: h2::server::SendResponse<Bytes>,
) {
    let host = target.uri.host().unwrap_or_default().to_string();
    let port = target.connect_port;

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, host = %host, port, "http2-connect-request upstream failed");
            let response = Response::builder().status(502).body(()).unwrap();
            let _ = respond.send_response(response, true);
            return;
        }
    };

    emit!("http2-connect-request", host = %host, port = port);

    let response = Response::builder().status(200).body(()).unwrap();
    let mut send_stream = match respond.send_response(response, false) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "http2 connect send_response failed");
            return;
        }
    };

    let upload = async {
        while let Some(chunk) = recv_stream.data().await {
            match chunk {
                Ok(bytes) => {
                    let len = bytes.len();
                    let _ = recv_stream.flow_control().release_capacity(len);
                    if upstream.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };

    let mut buf = [0u8; 8192];
    let download = async {
        loop {
            match upstream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if send_stream.send_data(Bytes::copy_from_slice(&buf[..n]), false).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = send_stream.send_data(Bytes::new(), true);
    };

    tokio::join!(upload, download);
}

async fn connect_upstream_stream(
    host: &str,
    port: u16,
    use_tls: bool,
    tls_connector: &TlsConnector,
) -> io::Result<MaybeTlsStream> {
    let stream = TcpStream::connect((host, port)).await?;
    if use_tls {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls_stream = tls_connector.connect(server_name, stream).await?;
        Ok(MaybeTlsStream::Tls(tls_stream))
    } else {
        Ok(MaybeTlsStream::Plain(stream))
    }
}

async fn consume_websocket_handshake(stream: &mut MaybeTlsStream) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut temp = [0u8; 1024];

    loop {
        let read = stream.read(&mut temp).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed during websocket handshake",
            ));
        }

        buffer.extend_from_slice(&temp[..read]);
        if let Some(end) = find_header_end(&buffer) {
            validate_websocket_status(&buffer[..end])?;
            let remainder = if buffer.len() > end {
                buffer[end..].to_vec()
            } else {
                Vec::new()
            };
            return Ok(remainder);
        }

        if buffer.len() > 8192 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "websocket handshake response too large",
            ));
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn validate_websocket_status(header: &[u8]) -> io::Result<()> {
    let text = std::str::from_utf8(header)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 in handshake response"))?;
    let status_line = text.lines().next().unwrap_or("HTTP/1.1 000 Unknown");
    if !status_line.contains("101") {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("upstream refused upgrade: {status_line}"),
        ));
    }
    Ok(())
}

fn format_host_header(host: &str, port: u16, use_tls: bool) -> String {
    let default_port = if use_tls { 443 } else { 80 };
    let value = if port == default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    format!("Host: {value}\r\n")
}

fn bad_gateway() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(empty_body())
        .unwrap()
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && headers.contains_key("upgrade")
}

enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, data),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn detects_upgrade_requests() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn ignores_non_upgrade_requests() {
        let headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(format_host_header("example.com", 443, true), "Host: example.com\r\n");
        assert_eq!(format_host_header("example.com", 8443, true), "Host: example.com:8443\r\n");
    }

    #[test]
    fn websocket_status_line_requires_101() {
        assert!(validate_websocket_status(b"HTTP/1.1 101 Switching Protocols\r\n\r\n").is_ok());
        assert!(validate_websocket_status(b"HTTP/1.1 403 Forbidden\r\n\r\n").is_err());
    }
}
