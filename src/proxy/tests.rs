use super::route::derive_route;
use super::server::ProxyServer;
use crate::config::ProxyConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config(port_start: u16) -> ProxyConfig {
    ProxyConfig { port_start, port_range: 20 }
}

#[tokio::test]
async fn test_proxy_server_start() {
    let server = ProxyServer::start(test_config(41200)).await;
    assert!(server.is_ok(), "failed to start proxy server");

    let server = server.unwrap();
    assert!(server.port() >= 41200);
    server.stop();
}

#[tokio::test]
async fn test_register_and_release_context() {
    let server = ProxyServer::start(test_config(41220)).await.unwrap();
    let route = derive_route("https://cmux-test-base-3000.cmux.app/");

    let context = server.registry().register(123, route, None);
    assert_eq!(context.web_contents_id, 123);
    assert!(!context.username.is_empty());
    assert!(!context.password.is_empty());

    assert!(server.registry().get_credentials(123).is_some());
    assert!(server.registry().release(123).is_some());
    assert!(server.registry().get_credentials(123).is_none());

    server.stop();
}

#[tokio::test]
async fn test_http1_request_without_credentials_gets_407() {
    let server = ProxyServer::start(test_config(41240)).await.expect("proxy server should start");
    let port = server.port();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to proxy");

    let request = b"GET http://localhost/ HTTP/1.1\r\nHost: localhost\r\n\r\n";
    stream.write_all(request).await.expect("write request through proxy");

    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.expect("read proxy response");
    let resp = String::from_utf8_lossy(&buf[..n]);
    assert!(
        resp.starts_with("HTTP/1.1 407") || resp.starts_with("HTTP/1.0 407"),
        "expected proxy auth response, got {resp}"
    );

    server.stop();
}

#[tokio::test]
async fn test_http1_request_with_valid_credentials_is_authenticated() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let server = ProxyServer::start(test_config(41260)).await.expect("proxy server should start");
    let port = server.port();
    let context = server.registry().register(1, None, None);

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let encoded = BASE64.encode(format!("{}:{}", context.username, context.password));
    let request = format!(
        "GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1\r\nProxy-Authorization: Basic {encoded}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await.expect("read proxy response");
    let resp = String::from_utf8_lossy(&buf[..n]);
    assert!(!resp.starts_with("HTTP/1.1 407"), "authenticated request should not be rejected, got {resp}");

    server.stop();
}
