//! Proxy-Authorization parsing and registry lookup (spec §3/§4.H).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::HeaderMap;

use super::registry::{ProxyContext, Registry};

pub fn parse_proxy_authorization(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get("proxy-authorization")?;
    let value = header.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

pub fn authenticate(registry: &Registry, headers: &HeaderMap) -> Option<ProxyContext> {
    let (username, password) = parse_proxy_authorization(headers)?;
    let context = registry.lookup_by_username(&username)?;
    if context.password == password {
        Some(context)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn basic_header(username: &str, password: &str) -> HeaderValue {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
    }

    #[test]
    fn parses_valid_basic_header() {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", basic_header("wc-1-aaaa", "secret"));
        let (u, p) = parse_proxy_authorization(&headers).unwrap();
        assert_eq!(u, "wc-1-aaaa");
        assert_eq!(p, "secret");
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        let headers = HeaderMap::new();
        assert!(parse_proxy_authorization(&headers).is_none());
    }

    #[test]
    fn authenticate_matches_registered_context() {
        let registry = Registry::default();
        let ctx = registry.register(3, None, None);
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", basic_header(&ctx.username, &ctx.password));
        assert!(authenticate(&registry, &headers).is_some());
    }

    #[test]
    fn authenticate_rejects_wrong_password() {
        let registry = Registry::default();
        let ctx = registry.register(4, None, None);
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", basic_header(&ctx.username, "wrong"));
        assert!(authenticate(&registry, &headers).is_none());
    }
}
