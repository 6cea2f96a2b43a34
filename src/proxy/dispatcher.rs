//! Upstream Dispatcher (spec §4.F): send a rewritten request upstream,
//! pooled HTTP/2 first, falling back to HTTP/1.1 only when no byte of the
//! H2 request has gone out yet. Grounded on `karl-digi-manaflow`'s
//! `handlers.rs::handle_http` (rewrite → forward → passthrough shape) and
//! `manaflow-ai-manaflow`'s `server.rs::handle_http` for the H1 leg; the
//! H2-first branch itself has no teacher precedent (see `h2_pool.rs`).

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use super::h2_pool::H2Pool;
use super::headers::sanitize_response_headers;
use super::target::ProxyTarget;
use crate::proxy::telemetry::emit;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
pub type H1Client = Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody>;

pub fn build_h1_client() -> H1Client {
    let connector = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Forward `req` to `target`, returning the response to write downstream.
/// `downstream_is_h2` controls response header flattening only (§4.D); it is
/// independent of which upstream transport was actually used.
pub async fn dispatch(
    req: Request<Incoming>,
    target: &ProxyTarget,
    downstream_is_h2: bool,
    h2_pool: &H2Pool,
    h1_client: &H1Client,
) -> Response<BoxBody> {
    let (parts, body) = req.into_parts();

    if target.secure {
        let host = target.uri.host().unwrap_or_default().to_string();
        let port = target.connect_port;

        match h2_pool.acquire(&host, port).await {
            Ok(mut send_request) => {
                let mut h2_req = Request::new(());
                *h2_req.method_mut() = parts.method.clone();
                *h2_req.uri_mut() = parts.uri.clone();
                *h2_req.headers_mut() = parts.headers.clone();
                match send_request.send_request(h2_req, false) {
                    Ok((response_fut, mut send_stream)) => {
                        emit!("http2-request", host = %host, port = port);

                        let body_task = async move {
                            let mut body = body;
                            loop {
                                match body.frame().await {
                                    Some(Ok(frame)) => {
                                        if let Ok(data) = frame.into_data() {
                                            if send_stream.send_data(data, false).is_err() {
                                                return;
                                            }
                                        }
                                    }
                                    Some(Err(_)) => {
                                        // Downstream body errored mid-stream: don't let the
                                        // upstream request look like it finished cleanly.
                                        send_stream.send_reset(h2::Reason::CANCEL);
                                        return;
                                    }
                                    None => break,
                                }
                            }
                            let _ = send_stream.send_data(Bytes::new(), true);
                        };
                        tokio::spawn(body_task);

                        match response_fut.await {
                            Ok(upstream_resp) => {
                                return finish_h2_response(upstream_resp, downstream_is_h2);
                            }
                            Err(e) => {
                                h2_pool.evict(&host, port);
                                tracing::warn!(error = %e, host = %host, "h2 stream closed before response");
                                emit!("http2-request-error", host = %host);
                                return bad_gateway();
                            }
                        }
                    }
                    Err(e) => {
                        h2_pool.evict(&host, port);
                        tracing::debug!(error = %e, host = %host, "h2 send_request failed before start, falling back to h1");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, host = %host, "h2 session init failed, falling back to h1");
                emit!("http2-session-init-failed", host = %host);
            }
        }
    }

    let req = Request::from_parts(parts, body.boxed());
    dispatch_h1(req, target, downstream_is_h2, h1_client).await
}

fn finish_h2_response(upstream_resp: Response<h2::RecvStream>, downstream_is_h2: bool) -> Response<BoxBody> {
    let (parts, recv) = upstream_resp.into_parts();
    let headers = sanitize_response_headers(&parts.headers, downstream_is_h2);
    let body = RecvStreamBody(recv)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = parts.status;
    *response.headers_mut() = headers;
    response
}

/// Adapts `h2::RecvStream` to `http_body::Body` so an upstream H2 response
/// can be streamed through the same `BoxBody` the rest of the dispatcher
/// uses, releasing flow-control capacity as each frame is consumed.
struct RecvStreamBody(h2::RecvStream);

impl http_body::Body for RecvStreamBody {
    type Data = Bytes;
    type Error = h2::Error;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
        use std::task::Poll;

        match self.0.poll_data(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let len = bytes.len();
                let _ = self.0.flow_control().release_capacity(len);
                Poll::Ready(Some(Ok(http_body::Frame::data(bytes))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => match self.0.poll_trailers(cx) {
                Poll::Ready(Ok(Some(trailers))) => Poll::Ready(Some(Ok(http_body::Frame::trailers(trailers)))),
                Poll::Ready(Ok(None)) => Poll::Ready(None),
                Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
                Poll::Pending => Poll::Pending,
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn dispatch_h1(
    req: Request<BoxBody>,
    target: &ProxyTarget,
    downstream_is_h2: bool,
    h1_client: &H1Client,
) -> Response<BoxBody> {
    let mut req = req;
    *req.uri_mut() = target.uri.clone();

    match h1_client.request(req).await {
        Ok(upstream_resp) => {
            let (parts, incoming) = upstream_resp.into_parts();
            let headers = sanitize_response_headers(&parts.headers, downstream_is_h2);
            let body = incoming
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                .boxed();
            let mut response = Response::new(body);
            *response.status_mut() = parts.status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            tracing::warn!(error = %e, "h1 upstream forward failed");
            emit!("http-forward-failed", error = %e.to_string());
            bad_gateway()
        }
    }
}

fn bad_gateway() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(
            Full::new(Bytes::from_static(b"Bad Gateway"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| Response::new(empty_body()))
}

pub fn empty_body() -> BoxBody {
    Empty::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Same algorithm as [`dispatch`], but the downstream side is a native H2
/// server stream (`h2::server::SendResponse`) rather than a hyper service
/// response. Used by the server acceptor's H2 branch, which talks raw `h2`
/// rather than `hyper::server::conn::http2` so it can also serve H2 CONNECT
/// (see `tunnel::handle_h2_connect`).
pub async fn dispatch_h2_downstream(
    req: Request<h2::RecvStream>,
    target: &ProxyTarget,
    h2_pool: &H2Pool,
    h1_client: &H1Client,
    mut respond: h2::server::SendResponse<Bytes>,
) {
    let (parts, mut recv_stream) = req.into_parts();

    if target.secure {
        let host = target.uri.host().unwrap_or_default().to_string();
        let port = target.connect_port;

        if let Ok(mut send_request) = h2_pool.acquire(&host, port).await {
            let mut h2_req = Request::new(());
            *h2_req.method_mut() = parts.method.clone();
            *h2_req.uri_mut() = parts.uri.clone();
            *h2_req.headers_mut() = parts.headers.clone();

            if let Ok((response_fut, mut send_stream)) = send_request.send_request(h2_req, false) {
                emit!("http2-request", host = %host, port = port);

                tokio::spawn(async move {
                    loop {
                        match recv_stream.data().await {
                            Some(Ok(bytes)) => {
                                let len = bytes.len();
                                let _ = recv_stream.flow_control().release_capacity(len);
                                if send_stream.send_data(bytes, false).is_err() {
                                    return;
                                }
                            }
                            Some(Err(_)) => {
                                // Downstream request aborted mid-stream: don't let the
                                // upstream request look like it finished cleanly.
                                send_stream.send_reset(h2::Reason::CANCEL);
                                return;
                            }
                            None => break,
                        }
                    }
                    let _ = send_stream.send_data(Bytes::new(), true);
                });

                match response_fut.await {
                    Ok(upstream_resp) => {
                        let (up_parts, mut up_body) = upstream_resp.into_parts();
                        let headers = sanitize_response_headers(&up_parts.headers, true);
                        let mut down = Response::builder().status(up_parts.status).body(()).unwrap();
                        *down.headers_mut() = headers;

                        if let Ok(mut send_stream) = respond.send_response(down, false) {
                            while let Some(chunk) = up_body.data().await {
                                match chunk {
                                    Ok(bytes) => {
                                        let len = bytes.len();
                                        let _ = up_body.flow_control().release_capacity(len);
                                        if send_stream.send_data(bytes, false).is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            let _ = send_stream.send_data(Bytes::new(), true);
                        }
                        return;
                    }
                    Err(e) => {
                        h2_pool.evict(&host, port);
                        tracing::warn!(error = %e, host = %host, "h2 stream closed before response");
                        let response = Response::builder().status(502).body(()).unwrap();
                        let _ = respond.send_response(response, true);
                        return;
                    }
                }
            }
            h2_pool.evict(&host, port);
        }
    }

    // H1 fallback: the upstream H2 acquisition/open failed before any byte
    // went out, so it's safe to retry over H1. Buffer the (typically small,
    // since this only happens pre-start) request body and replay it.
    let mut buffered = Vec::new();
    while let Some(chunk) = recv_stream.data().await {
        match chunk {
            Ok(bytes) => buffered.extend_from_slice(&bytes),
            Err(_) => break,
        }
    }

    let mut h1_req = Request::builder()
        .method(parts.method.clone())
        .uri(target.uri.clone());
    for (name, value) in parts.headers.iter() {
        h1_req = h1_req.header(name.clone(), value.clone());
    }
    let h1_req = h1_req
        .body(Full::new(Bytes::from(buffered)).map_err(|never| match never {}).boxed())
        .unwrap();

    let response = dispatch_h1(h1_req, target, true, h1_client).await;
    let (down_parts, mut down_body) = response.into_parts();
    let mut down = Response::builder().status(down_parts.status).body(()).unwrap();
    *down.headers_mut() = down_parts.headers;

    if let Ok(mut send_stream) = respond.send_response(down, false) {
        while let Some(frame) = down_body.frame().await {
            if let Ok(frame) = frame {
                if let Ok(data) = frame.into_data() {
                    if send_stream.send_data(data, false).is_err() {
                        break;
                    }
                }
            } else {
                break;
            }
        }
        let _ = send_stream.send_data(Bytes::new(), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h1_client_builds() {
        let _client = build_h1_client();
    }
}
