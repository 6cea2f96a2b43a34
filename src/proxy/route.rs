//! Route Parser (spec §4.A) and the loopback/rewrite helpers it shares with
//! the target rewriter (§4.C). Regex-free split-based parsing, following the
//! teacher's own `routing.rs` rather than the regex variant seen elsewhere in
//! the pack.

use url::Url;

pub const CMUX_DOMAINS: &[&str] = &[
    "cmux.app",
    "cmux.sh",
    "cmux.dev",
    "cmux.local",
    "cmux.localhost",
    "autobuild.app",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub morph_id: String,
    pub scope: String,
    pub domain_suffix: String,
}

/// Derive a [`Route`] from a view's initial URL. Returns `None` (never an
/// error) when the hostname matches neither accepted pattern; the caller logs
/// at warn in that case and the view simply runs without rewriting.
pub fn derive_route(initial_url: &str) -> Option<Route> {
    let parsed = Url::parse(initial_url).ok()?;
    let hostname = parsed.host_str()?.to_ascii_lowercase();

    if let Some(route) = derive_morph_route(&hostname) {
        return Some(route);
    }
    derive_cmux_route(&hostname)
}

fn derive_morph_route(hostname: &str) -> Option<Route> {
    let rest = hostname.strip_prefix("port-")?;
    let morph_part = rest.strip_suffix(".http.cloud.morph.so")?;
    let idx = morph_part.find("-morphvm-")?;
    let (_port, morph_id) = morph_part.split_at(idx);
    let morph_id = &morph_id[9..]; // skip "-morphvm-"
    if morph_id.is_empty() {
        return None;
    }
    Some(Route {
        morph_id: morph_id.to_string(),
        scope: "base".to_string(),
        domain_suffix: "cmux.app".to_string(),
    })
}

fn derive_cmux_route(hostname: &str) -> Option<Route> {
    for &domain in CMUX_DOMAINS {
        let suffix = format!(".{domain}");
        let Some(subdomain) = hostname.strip_suffix(&suffix) else {
            continue;
        };
        let Some(remainder) = subdomain.strip_prefix("cmux-") else {
            continue;
        };

        let mut segments: Vec<&str> = remainder.split('-').filter(|s| !s.is_empty()).collect();
        if segments.len() < 3 {
            continue;
        }

        let port_segment = segments.pop().unwrap();
        if !port_segment.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let scope_segment = segments.pop().unwrap();
        let morph_id = segments.join("-");
        if morph_id.is_empty() {
            continue;
        }

        return Some(Route {
            morph_id,
            scope: scope_segment.to_string(),
            domain_suffix: domain.to_string(),
        });
    }
    None
}

/// Build the rewritten host for a route at a given port (spec §3/§6).
pub fn build_cmux_host(route: &Route, port: u16) -> String {
    let safe_port = if port == 0 { 80 } else { port };
    format!(
        "cmux-{}-{}-{}.{}",
        route.morph_id, route.scope, safe_port, route.domain_suffix
    )
}

/// Whether `hostname` is a loopback literal per the shared contract in §6.
/// This exact set is load-bearing: enlarging it silently breaks rewriting.
pub fn is_loopback_hostname(hostname: &str) -> bool {
    let lower = hostname.to_ascii_lowercase();
    match lower.as_str() {
        "localhost" | "localhost.localdomain" | "127.0.0.1" | "::1" | "[::1]" => return true,
        _ => {}
    }
    if lower.starts_with("127.") || lower.starts_with("[::ffff:127.") {
        return true;
    }
    false
}

/// The requested port per §4.A/§4.C: explicit URL port if positive, else the
/// scheme default.
pub fn determine_requested_port(scheme: &str, port: Option<u16>) -> u16 {
    match port {
        Some(p) if p > 0 => p,
        _ => match scheme {
            "https" | "wss" => 443,
            _ => 80,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_morph_route() {
        let route = derive_route("https://port-8080-morphvm-xyz.http.cloud.morph.so/").unwrap();
        assert_eq!(route.morph_id, "xyz");
        assert_eq!(route.scope, "base");
        assert_eq!(route.domain_suffix, "cmux.app");
    }

    #[test]
    fn derives_cmux_route_with_multi_segment_morph_id() {
        let route = derive_route("http://cmux-my-long-morph-id-base-3000.cmux.app/").unwrap();
        assert_eq!(route.morph_id, "my-long-morph-id");
        assert_eq!(route.scope, "base");
        assert_eq!(route.domain_suffix, "cmux.app");
    }

    #[test]
    fn derives_cmux_route_with_scope() {
        let route = derive_route("https://cmux-morph01-staging-39378.cmux.sh/").unwrap();
        assert_eq!(route.morph_id, "morph01");
        assert_eq!(route.scope, "staging");
        assert_eq!(route.domain_suffix, "cmux.sh");
    }

    #[test]
    fn rejects_unrelated_hosts() {
        assert!(derive_route("https://google.com/").is_none());
        assert!(derive_route("not a url").is_none());
    }

    #[test]
    fn route_derivation_round_trips_through_build_cmux_host() {
        let route = Route {
            morph_id: "abcd".into(),
            scope: "base".into(),
            domain_suffix: "cmux.app".into(),
        };
        let host = build_cmux_host(&route, 8080);
        let initial_url = format!("https://{host}/");
        assert_eq!(derive_route(&initial_url).as_ref(), Some(&route));
    }

    #[test]
    fn loopback_hostnames() {
        assert!(is_loopback_hostname("localhost"));
        assert!(is_loopback_hostname("127.0.0.1"));
        assert!(is_loopback_hostname("127.18.0.5"));
        assert!(is_loopback_hostname("::1"));
        assert!(is_loopback_hostname("[::1]"));
        assert!(!is_loopback_hostname("cmux.app"));
        assert!(!is_loopback_hostname("example.com"));
    }

    #[test]
    fn requested_port_defaults() {
        assert_eq!(determine_requested_port("http", Some(8080)), 8080);
        assert_eq!(determine_requested_port("https", None), 443);
        assert_eq!(determine_requested_port("http", None), 80);
        assert_eq!(determine_requested_port("wss", None), 443);
    }
}
