//! Target Parser & Rewriter (spec §4.C): turn a request's wire-level target
//! into a `ProxyTarget`, and rewrite loopback hosts into per-route remote
//! hosts. Built on `http::Uri`, following the teacher's choice in
//! `routing.rs::rewrite_url_if_needed`, generalized to the spec's four parse
//! shapes (the teacher only needs absolute/origin-form; H2 authority-form and
//! CONNECT authority-form are new here).

use http::{HeaderMap, Uri};

use super::route::{build_cmux_host, determine_requested_port, is_loopback_hostname, Route};
use crate::error::ProxyError;

#[derive(Clone, Debug)]
pub struct ProxyTarget {
    pub uri: Uri,
    pub secure: bool,
    pub connect_port: u16,
}

/// HTTP/1.1 absolute-form: the request line already carries `scheme://`.
/// `ws`/`wss` are normalized to `http`/`https` before parsing (spec §4.C).
pub fn parse_absolute_form(uri: &Uri) -> Result<Uri, ProxyError> {
    let raw = uri.to_string();
    let normalized = normalize_ws_scheme(&raw);
    normalized
        .parse::<Uri>()
        .map_err(|e| ProxyError::TargetParseError(e.to_string()))
}

/// HTTP/1.1 origin-form: request line is path-only, combine with `Host`.
pub fn parse_origin_form(uri: &Uri, headers: &HeaderMap) -> Result<Uri, ProxyError> {
    let host = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProxyError::TargetParseError("missing Host header".into()))?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{host}{path}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::TargetParseError(e.to_string()))
}

/// HTTP/2: build `<:scheme>://<:authority><:path>`, defaulting scheme to
/// `https` and path to `/` when absent (spec §4.C).
pub fn parse_h2_authority_form(uri: &Uri) -> Result<Uri, ProxyError> {
    let scheme = uri.scheme_str().unwrap_or("https");
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::TargetParseError("missing :authority".into()))?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{authority}{path}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::TargetParseError(e.to_string()))
}

/// CONNECT authority-form: `host:port`, port mandatory.
pub fn parse_connect_authority(authority: &str) -> Result<Uri, ProxyError> {
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::TargetParseError("CONNECT target missing port".into()))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| ProxyError::TargetParseError("CONNECT port not numeric".into()))?;
    format!("https://{host}:{port}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::TargetParseError(e.to_string()))
}

fn normalize_ws_scheme(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("ws://") {
        format!("http://{}", &raw[5..])
    } else if lower.starts_with("wss://") {
        format!("https://{}", &raw[6..])
    } else {
        raw.to_string()
    }
}

/// Rewrite `uri` against `route` per §4.C. Non-loopback hosts, or a view with
/// no route, pass through unchanged.
pub fn rewrite_target(uri: &Uri, route: Option<&Route>) -> Result<ProxyTarget, ProxyError> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::TargetParseError("missing host".into()))?;
    let scheme = uri.scheme_str().unwrap_or("http");
    let explicit_port = uri.port_u16();

    let Some(route) = route else {
        return Ok(passthrough_target(uri, scheme, explicit_port));
    };
    if !is_loopback_hostname(host) {
        return Ok(passthrough_target(uri, scheme, explicit_port));
    }

    let requested_port = determine_requested_port(scheme, explicit_port);
    let new_host = build_cmux_host(route, requested_port);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let rewritten = format!("https://{new_host}{path}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::TargetParseError(e.to_string()))?;

    Ok(ProxyTarget {
        uri: rewritten,
        secure: true,
        connect_port: 443,
    })
}

fn passthrough_target(uri: &Uri, scheme: &str, explicit_port: Option<u16>) -> ProxyTarget {
    let secure = matches!(scheme, "https" | "wss");
    let connect_port = determine_requested_port(scheme, explicit_port);
    ProxyTarget {
        uri: uri.clone(),
        secure,
        connect_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            morph_id: "abcd".into(),
            scope: "base".into(),
            domain_suffix: "cmux.app".into(),
        }
    }

    #[test]
    fn rewrites_loopback_target() {
        let uri: Uri = "http://127.0.0.1:8080/api".parse().unwrap();
        let target = rewrite_target(&uri, Some(&route())).unwrap();
        assert_eq!(target.uri.to_string(), "https://cmux-abcd-base-8080.cmux.app/api");
        assert!(target.secure);
        assert_eq!(target.connect_port, 443);
    }

    #[test]
    fn passes_through_non_loopback() {
        let uri: Uri = "https://example.com/".parse().unwrap();
        let target = rewrite_target(&uri, Some(&route())).unwrap();
        assert_eq!(target.uri, uri);
        assert_eq!(target.connect_port, 443);
    }

    #[test]
    fn passes_through_when_route_absent() {
        let uri: Uri = "http://127.0.0.1:3000/".parse().unwrap();
        let target = rewrite_target(&uri, None).unwrap();
        assert_eq!(target.uri, uri);
        assert!(!target.secure);
        assert_eq!(target.connect_port, 3000);
    }

    #[test]
    fn normalizes_ws_and_wss_schemes() {
        let uri: Uri = "ws://127.0.0.1:9000/socket".parse().unwrap();
        let normalized = parse_absolute_form(&uri).unwrap();
        assert_eq!(normalized.scheme_str(), Some("http"));
    }

    #[test]
    fn origin_form_combines_with_host_header() {
        let uri: Uri = "/api/widgets".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "127.0.0.1:8080".parse().unwrap());
        let combined = parse_origin_form(&uri, &headers).unwrap();
        assert_eq!(combined.to_string(), "http://127.0.0.1:8080/api/widgets");
    }

    #[test]
    fn connect_authority_requires_port() {
        assert!(parse_connect_authority("127.0.0.1").is_err());
        let uri = parse_connect_authority("127.0.0.1:3000").unwrap();
        assert_eq!(uri.to_string(), "https://127.0.0.1:3000/");
    }
}
