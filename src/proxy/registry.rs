//! Credential Registry (spec §4.B): a process-wide bidirectional map between
//! usernames and view ids, both resolving to the same `ProxyContext`.
//!
//! The teacher (`manaflow-ai-manaflow/.../proxy/server.rs`) keeps two
//! separately-locked `parking_lot::RwLock<HashMap<_,_>>` fields
//! (`contexts`, `contexts_by_username`) updated one after the other. That
//! satisfies §4.B in practice but not by construction — a reader between the
//! two inserts could observe a half-registered context. This module instead
//! wraps both maps in a single lock so register/release are atomic.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use super::route::Route;

#[derive(Clone, Debug)]
pub struct ProxyContext {
    pub username: String,
    pub password: String,
    pub route: Option<Route>,
    pub web_contents_id: u32,
    pub persist_key: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

struct Inner {
    by_username: HashMap<String, ProxyContext>,
    by_view_id: HashMap<u32, String>,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                by_username: HashMap::new(),
                by_view_id: HashMap::new(),
            })),
        }
    }

    /// Mint a context for `web_contents_id` and register it under both
    /// indices atomically. Re-registering a view that already has a context
    /// (e.g. a reload without an intervening `release`) replaces it instead
    /// of orphaning the old `by_username` entry.
    pub fn register(
        &self,
        web_contents_id: u32,
        route: Option<Route>,
        persist_key: Option<String>,
    ) -> ProxyContext {
        let (username, password) = generate_credentials(web_contents_id);
        let context = ProxyContext {
            username: username.clone(),
            password,
            route,
            web_contents_id,
            persist_key,
        };

        let mut guard = self.inner.write();
        if let Some(old_username) = guard.by_view_id.insert(web_contents_id, username.clone()) {
            guard.by_username.remove(&old_username);
        }
        guard.by_username.insert(username, context.clone());
        context
    }

    /// Remove both indices for `web_contents_id`. Returns the removed
    /// context, or `None` if the view had no registered context (this is not
    /// an error — `release` is idempotent per §4.I).
    pub fn release(&self, web_contents_id: u32) -> Option<ProxyContext> {
        let mut guard = self.inner.write();
        let username = guard.by_view_id.remove(&web_contents_id)?;
        guard.by_username.remove(&username)
    }

    pub fn lookup_by_username(&self, username: &str) -> Option<ProxyContext> {
        self.inner.read().by_username.get(username).cloned()
    }

    pub fn get_credentials(&self, web_contents_id: u32) -> Option<(String, String)> {
        let guard = self.inner.read();
        let username = guard.by_view_id.get(&web_contents_id)?;
        let ctx = guard.by_username.get(username)?;
        Some((ctx.username.clone(), ctx.password.clone()))
    }
}

/// Username includes the view id plus 4 random bytes of hex; password is 12
/// random bytes of hex (spec §3).
fn generate_credentials(web_contents_id: u32) -> (String, String) {
    let mut rng = rand::thread_rng();
    let username_suffix: String = (0..4).map(|_| format!("{:02x}", rng.gen::<u8>())).collect();
    let username = format!("wc-{web_contents_id}-{username_suffix}");
    let password: String = (0..12).map(|_| format!("{:02x}", rng.gen::<u8>())).collect();
    (username, password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_both_indices() {
        let registry = Registry::new();
        let ctx = registry.register(7, None, Some("task-run-preview:abc".into()));

        let by_username = registry.lookup_by_username(&ctx.username).unwrap();
        assert_eq!(by_username.web_contents_id, 7);

        let creds = registry.get_credentials(7).unwrap();
        assert_eq!(creds.0, ctx.username);
        assert_eq!(creds.1, ctx.password);
    }

    #[test]
    fn release_removes_both_indices() {
        let registry = Registry::new();
        let ctx = registry.register(1, None, None);
        assert!(registry.lookup_by_username(&ctx.username).is_some());

        let removed = registry.release(1);
        assert!(removed.is_some());
        assert!(registry.lookup_by_username(&ctx.username).is_none());
        assert!(registry.get_credentials(1).is_none());
    }

    #[test]
    fn reregistering_a_view_drops_the_old_username_entry() {
        let registry = Registry::new();
        let first = registry.register(9, None, None);
        let second = registry.register(9, None, None);

        assert_ne!(first.username, second.username);
        assert!(registry.lookup_by_username(&first.username).is_none());
        assert!(registry.lookup_by_username(&second.username).is_some());
        assert_eq!(registry.get_credentials(9).unwrap().0, second.username);
    }

    #[test]
    fn release_is_idempotent() {
        let registry = Registry::new();
        registry.register(2, None, None);
        assert!(registry.release(2).is_some());
        assert!(registry.release(2).is_none());
    }

    #[test]
    fn generated_credentials_are_unique_per_call() {
        let (u1, p1) = generate_credentials(5);
        let (u2, p2) = generate_credentials(5);
        assert_ne!(u1, u2);
        assert_ne!(p1, p2);
        assert!(u1.starts_with("wc-5-"));
        assert_eq!(p1.len(), 24);
    }
}
