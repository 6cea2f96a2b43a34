//! Header Sanitizer (spec §4.D). Neither teacher file extracts this into a
//! standalone unit — `handlers.rs`/`server.rs` inline an ad hoc header copy
//! per call site. This module generalizes that inline logic into the spec's
//! exact two-sanitizer contract.

use http::header::{HeaderName, HOST, PROXY_AUTHORIZATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

/// Hop-by-hop headers that must never cross the proxy (spec §3).
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "proxy-connection" | "keep-alive" | "upgrade" | "transfer-encoding" | "te" | "trailer"
    )
}

fn is_pseudo_header(name: &HeaderName) -> bool {
    name.as_str().starts_with(':')
}

/// Request sanitizer (client → upstream): drop pseudo-headers, drop
/// `proxy-authorization`, drop hop-by-hop, then force `host` to the
/// post-rewrite authority.
pub fn sanitize_request_headers(src: &HeaderMap, rewritten_host: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        if is_pseudo_header(name) || name == PROXY_AUTHORIZATION || is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.remove(HOST);
    if let Ok(value) = HeaderValue::from_str(rewritten_host) {
        out.insert(HOST, value);
    }
    join_multi_valued(&mut out);
    out
}

/// Response sanitizer (upstream → client): drop pseudo-headers and
/// hop-by-hop. `set-cookie` stays an array when `downstream_is_h2`; every
/// other multi-valued header is joined with `", "`.
pub fn sanitize_response_headers(src: &HeaderMap, downstream_is_h2: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        if is_pseudo_header(name) || is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if downstream_is_h2 {
        join_multi_valued_except(&mut out, &SET_COOKIE);
    } else {
        join_multi_valued(&mut out);
    }
    out
}

/// Collapse every header with more than one value into a single
/// comma-space-joined value, in place.
fn join_multi_valued(headers: &mut HeaderMap) {
    join_multi_valued_except(headers, &HOST /* sentinel never hit twice */);
}

fn join_multi_valued_except(headers: &mut HeaderMap, preserve: &HeaderName) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| headers.get_all(*name).iter().count() > 1)
        .cloned()
        .collect();
    for name in names {
        if &name == preserve {
            continue;
        }
        let joined = headers
            .get_all(&name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        headers.remove(&name);
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn request_sanitizer_drops_hop_by_hop_and_auth_and_forces_host() {
        let mut src = HeaderMap::new();
        src.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        src.insert("connection", HeaderValue::from_static("keep-alive"));
        src.insert(HOST, HeaderValue::from_static("127.0.0.1:8080"));
        src.insert("accept", HeaderValue::from_static("text/html"));

        let out = sanitize_request_headers(&src, "cmux-abcd-base-8080.cmux.app");
        assert!(!out.contains_key(PROXY_AUTHORIZATION));
        assert!(!out.contains_key("connection"));
        assert_eq!(
            out.get(HOST).unwrap(),
            "cmux-abcd-base-8080.cmux.app"
        );
        assert_eq!(out.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn response_sanitizer_preserves_set_cookie_array_for_h2_downstream() {
        let mut src = HeaderMap::new();
        src.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        src.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        src.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let out = sanitize_response_headers(&src, true);
        let cookies: Vec<_> = out.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert!(!out.contains_key("transfer-encoding"));
    }

    #[test]
    fn response_sanitizer_joins_set_cookie_for_h1_downstream() {
        let mut src = HeaderMap::new();
        src.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        src.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        let out = sanitize_response_headers(&src, false);
        let cookies: Vec<_> = out.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0], "a=1, b=2");
    }

    #[test]
    fn never_forwards_pseudo_headers() {
        let mut src = HeaderMap::new();
        let pseudo = HeaderName::from_bytes(b"x-normal").unwrap();
        src.insert(pseudo.clone(), HeaderValue::from_static("ok"));
        let out = sanitize_request_headers(&src, "example.com");
        assert!(out.contains_key(pseudo));
    }
}
