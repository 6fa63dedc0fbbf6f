use crate::error::EmbedError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Validate a user-supplied proxy target before fetching it (SSRF guard).
///
/// Only `http://` and `https://` URLs are accepted. IP literals in private,
/// loopback or link-local ranges are refused unless `allow_private` is set.
/// Hostnames are not resolved, so DNS rebinding is not covered here.
pub fn validate_proxy_target(url: &str, allow_private: bool) -> Result<Url, EmbedError> {
    let parsed =
        Url::parse(url).map_err(|_| EmbedError::InvalidTarget(format!("Invalid URL: {url}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(EmbedError::InvalidTarget(format!(
                "Scheme '{scheme}' not allowed, only http/https"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| EmbedError::InvalidTarget(format!("No host in URL: {url}")))?;

    if allow_private {
        return Ok(parsed);
    }

    let blocked = match host {
        Host::Ipv4(ip) => is_blocked_ipv4(ip),
        Host::Ipv6(ip) => is_blocked_ipv6(ip),
        Host::Domain(name) => name.eq_ignore_ascii_case("localhost"),
    };
    if blocked {
        return Err(EmbedError::InvalidTarget(format!(
            "Private or reserved address not allowed: {host}"
        )));
    }

    Ok(parsed)
}

/// `0/8`, `10/8`, `127/8`, `169.254/16`, `172.16/12`, `192.168/16`.
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 0
        || a == 10
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
}

/// Loopback, `fe80::/10`, `fc00::/7`, and IPv4-mapped blocked addresses.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let s = ip.segments();
    ip.is_loopback() || ip.is_unspecified() || (s[0] & 0xffc0) == 0xfe80 || (s[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(url: &str) -> bool {
        validate_proxy_target(url, false).is_err()
    }

    #[test]
    fn rejects_private_ipv4() {
        assert!(rejected("http://127.0.0.1/seg.ts"));
        assert!(rejected("http://10.1.2.3/seg.ts"));
        assert!(rejected("http://172.20.0.1/seg.ts"));
        assert!(rejected("http://192.168.1.1/seg.ts"));
        assert!(rejected("http://169.254.169.254/latest/meta-data/"));
        assert!(rejected("http://0.0.0.0/seg.ts"));
    }

    #[test]
    fn rejects_private_ipv6() {
        assert!(rejected("http://[::1]/seg.ts"));
        assert!(rejected("http://[fe80::1]/seg.ts"));
        assert!(rejected("http://[fd00::1]/seg.ts"));
        assert!(rejected("http://[::ffff:127.0.0.1]/seg.ts"));
    }

    #[test]
    fn rejects_localhost_name() {
        assert!(rejected("http://localhost:8080/key"));
    }

    #[test]
    fn rejects_bad_schemes_and_garbage() {
        assert!(rejected("file:///etc/passwd"));
        assert!(rejected("ftp://cdn.example/seg.ts"));
        assert!(rejected("cdn.example/seg.ts"));
        assert!(rejected(""));
    }

    #[test]
    fn allows_public_targets() {
        assert!(validate_proxy_target("https://cdn.example/hls/1.ts?u_id=x", false).is_ok());
        assert!(validate_proxy_target("http://8.8.8.8/key", false).is_ok());
        assert!(validate_proxy_target("http://172.32.0.1/seg.ts", false).is_ok());
    }

    #[test]
    fn private_allowed_when_configured() {
        assert!(validate_proxy_target("http://127.0.0.1:9000/seg.ts", true).is_ok());
        assert!(validate_proxy_target("file:///etc/passwd", true).is_err());
    }
}
