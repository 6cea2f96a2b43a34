//! H2 Client Session Pool (spec §4.E). The teacher never keeps a pool of
//! outbound HTTP/2 sessions — it reaches for `hyper_rustls`'s pooling
//! `Client` instead (see `server.rs::build_http_client`). That type can't
//! expose the per-host H2 handle the dispatcher needs to retry over H1
//! before any byte has gone out, so this module opens raw `h2` sessions
//! directly, following the `h2::client::handshake` + spawned connection-driver
//! pattern in `other_examples/...cursor-proxy/src/main.rs`. Entries are keyed
//! by `host:port` in a `dashmap::DashMap`, the same concurrent-keyed-cache
//! shape `karlorz-cmux` uses for its registry.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use h2::client::{self, SendRequest};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::error::ProxyError;

#[derive(Clone)]
pub struct H2Pool {
    sessions: Arc<DashMap<String, SendRequest<Bytes>>>,
    tls_connector: TlsConnector,
}

impl H2Pool {
    pub fn new() -> Result<Self, ProxyError> {
        Ok(Self {
            sessions: Arc::new(DashMap::new()),
            tls_connector: build_tls_connector()?,
        })
    }

    /// Return a ready `SendRequest` handle for `host:port`, reusing a cached
    /// session when it is still usable and opening a fresh one otherwise.
    pub async fn acquire(&self, host: &str, port: u16) -> Result<SendRequest<Bytes>, ProxyError> {
        let key = format!("{host}:{port}");

        if let Some(entry) = self.sessions.get(&key) {
            let mut candidate = entry.value().clone();
            drop(entry);
            if candidate.ready().await.is_ok() {
                return Ok(candidate);
            }
            self.sessions.remove(&key);
        }

        let send_request = self.open_session(host, port).await?;
        self.sessions.insert(key, send_request.clone());
        Ok(send_request)
    }

    /// Drop a session after a stream-level error or GOAWAY so the next
    /// `acquire` opens a fresh one instead of reusing a half-dead handle.
    pub fn evict(&self, host: &str, port: u16) {
        self.sessions.remove(&format!("{host}:{port}"));
    }

    async fn open_session(&self, host: &str, port: u16) -> Result<SendRequest<Bytes>, ProxyError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProxyError::UpstreamConnectError(Box::new(e)))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::UpstreamConnectError(Box::new(e)))?;
        let tls = self
            .tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamConnectError(Box::new(e)))?;

        let (send_request, connection) = client::Builder::new()
            .handshake(tls)
            .await
            .map_err(|e| ProxyError::UpstreamConnectError(Box::new(e)))?;

        let sessions = self.sessions.clone();
        let key = format!("{host}:{port}");
        let host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, host = %host, "h2 upstream connection ended");
            }
            sessions.remove(&key);
        });

        Ok(send_request)
    }
}

fn build_tls_connector() -> Result<TlsConnector, ProxyError> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols.push(b"h2".to_vec());
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_empty() {
        let pool = H2Pool::new().unwrap();
        assert_eq!(pool.sessions.len(), 0);
    }

    #[test]
    fn evict_on_empty_pool_is_a_no_op() {
        let pool = H2Pool::new().unwrap();
        pool.evict("example.com", 443);
    }
}
