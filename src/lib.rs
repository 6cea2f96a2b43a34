#![deny(clippy::all)]

mod config;
mod error;
mod proxy;

use std::sync::Arc;

use napi::bindgen_prelude::*;
use napi_derive::napi;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use config::ProxyConfig;

const PERSIST_KEY_PREFIX: &str = "task-run-preview:";

#[napi(object)]
pub struct ConfigureViewResult {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub proxy_rules: String,
    pub bypass_list: String,
}

#[napi(object)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// Public Control Surface (spec §4.I). One process-wide proxy: the server
/// is created lazily on the first `configure_for_view` call and retained
/// across views, matching the teacher's `ProxyServer` napi struct shape
/// (`start`/`create_context`/`release_context`/`port`/`stop`), generalized
/// to the full surface this spec names.
#[napi]
pub struct PreviewProxy {
    inner: Arc<Mutex<Option<proxy::ProxyServer>>>,
}

impl Default for PreviewProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[napi]
impl PreviewProxy {
    #[napi(constructor)]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(None)) }
    }

    /// Derive a Route from `initial_url` (may be none), ensure the server is
    /// listening, mint credentials, and register a context for the view.
    #[napi]
    pub async fn configure_for_view(
        &self,
        web_contents_id: u32,
        initial_url: String,
        persist_key: Option<String>,
    ) -> Result<ConfigureViewResult> {
        let route = proxy::route::derive_route(&initial_url);
        if route.is_none() {
            tracing::warn!(url = %initial_url, "initial url matched no route pattern, view will run unrewritten");
        }

        let port = self.ensure_started().await?;

        let server = self.inner.lock();
        let server = server.as_ref().expect("server was just ensured");
        let context = server.registry().register(web_contents_id, route, persist_key);
        proxy::telemetry::emit!("configured-context", web_contents_id = web_contents_id);

        Ok(ConfigureViewResult {
            port,
            username: context.username,
            password: context.password,
            proxy_rules: format!("http=127.0.0.1:{port};https=127.0.0.1:{port}"),
            bypass_list: "<-loopback>".to_string(),
        })
    }

    /// Deregister a view. Idempotent: releasing twice is a no-op the second
    /// time (spec §4.I).
    #[napi]
    pub fn release(&self, web_contents_id: u32) {
        let server = self.inner.lock();
        if let Some(server) = server.as_ref() {
            if server.registry().release(web_contents_id).is_some() {
                proxy::telemetry::emit!("released-context", web_contents_id = web_contents_id);
                proxy::telemetry::emit!("reset-session-proxy", web_contents_id = web_contents_id);
            }
        }
    }

    #[napi]
    pub fn get_credentials(&self, web_contents_id: u32) -> Option<ProxyCredentials> {
        let server = self.inner.lock();
        let server = server.as_ref()?;
        let (username, password) = server.registry().get_credentials(web_contents_id)?;
        Some(ProxyCredentials { username, password })
    }

    #[napi]
    pub fn set_logging_enabled(&self, enabled: bool) {
        proxy::telemetry::set_logging_enabled(enabled);
    }

    async fn ensure_started(&self) -> Result<u16> {
        {
            let guard = self.inner.lock();
            if let Some(server) = guard.as_ref() {
                return Ok(server.port());
            }
        }

        let server = proxy::ProxyServer::start(ProxyConfig::default())
            .await
            .map_err(|e| Error::from_reason(e.to_string()))?;
        let port = server.port();

        let mut guard = self.inner.lock();
        if guard.is_none() {
            *guard = Some(server);
        } else if let Some(existing) = guard.as_ref() {
            return Ok(existing.port());
        }
        Ok(port)
    }
}

/// `key` belongs to a preview-proxy-backed view iff it starts with
/// `task-run-preview:` (spec §4.I).
#[napi]
pub fn is_preview_persist_key(key: String) -> bool {
    key.starts_with(PERSIST_KEY_PREFIX)
}

/// `persist:cmux-preview-<hex24>` where `<hex24>` is the first 24 hex
/// characters of SHA-256(key); `None` for keys that aren't preview keys.
/// Deterministic: equal inputs always produce equal outputs.
#[napi]
pub fn partition_for_persist_key(key: String) -> Option<String> {
    if !is_preview_persist_key(key.clone()) {
        return None;
    }
    let digest = Sha256::digest(key.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    Some(format!("persist:cmux-preview-{}", &hex[..24]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_key_prefix_check() {
        assert!(is_preview_persist_key("task-run-preview:abc".to_string()));
        assert!(!is_preview_persist_key("other:abc".to_string()));
    }

    #[test]
    fn partition_is_deterministic_and_shaped() {
        let a = partition_for_persist_key("task-run-preview:abc".to_string()).unwrap();
        let b = partition_for_persist_key("task-run-preview:abc".to_string()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("persist:cmux-preview-"));
        assert_eq!(a.len(), "persist:cmux-preview-".len() + 24);
    }

    #[test]
    fn partition_is_none_for_non_preview_keys() {
        assert!(partition_for_persist_key("other:xyz".to_string()).is_none());
    }
}
