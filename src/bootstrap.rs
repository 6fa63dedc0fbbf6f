//! Embed bootstrap script decoding.
//!
//! The embed page carries its player configuration as a handful of
//! single-letter variable assignments inside one inline `<script>`. Values
//! are recognised by the shape of their literal rather than by variable
//! name, because the names are reshuffled on every deploy.

use crate::error::{EmbedError, Result};
use crate::extract::{EmbedParams, ensure_page_ok};
use base64::{Engine as _, engine::general_purpose};
use regex::Regex;
use reqwest::{Client, header};
use std::sync::LazyLock;
use tracing::{debug, info};

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>(.*?)</script>").expect("static regex")
});

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[^A-Za-z0-9_$.])(?:(?:var|let|const)\s+)?([A-Za-z_$])\s*=\s*(?:atob\(\s*["']([A-Za-z0-9+/=_-]*)["']\s*\)|["']([^"'\\]*)["']|(?:String\.fromCharCode\(\s*(?:\.\.\.)?\s*)?\[\s*(\d+(?:\s*,\s*\d+)*)\s*,?\s*\]|(\d+)\b)"#,
    )
    .expect("static regex")
});

static HOST_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+(?:-[A-Za-z0-9]+)+$").expect("static regex"));

static ALNUM_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{6,}$").expect("static regex"));

/// Identifiers and pre-signed URLs recovered from the embed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedBootstrap {
    pub device_id: String,
    pub stream_id: String,
    pub host_id: String,
    pub initial_access_code: String,
    pub csrf_auth_value: String,
    pub token_base_url: String,
    pub manifest_url_template: String,
    /// Integer literal from the script; sent as `expires` on refresh.
    pub issued_at_epoch_secs: i64,
}

impl EmbedBootstrap {
    /// Whether the access code is still inside its validity window.
    pub fn is_fresh(&self, now_epoch_secs: i64, ttl_secs: i64) -> bool {
        now_epoch_secs - self.issued_at_epoch_secs <= ttl_secs
    }
}

#[derive(Debug)]
enum Literal {
    Base64(String),
    Str(String),
    CharCodes(String),
    Int(String),
}

fn scan_literals(script: &str) -> Vec<(String, Literal)> {
    ASSIGNMENT
        .captures_iter(script)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_string();
            let literal = if let Some(m) = c.get(2) {
                Literal::Base64(m.as_str().to_string())
            } else if let Some(m) = c.get(3) {
                Literal::Str(m.as_str().to_string())
            } else if let Some(m) = c.get(4) {
                Literal::CharCodes(from_char_codes(m.as_str())?)
            } else {
                Literal::Int(c.get(5)?.as_str().to_string())
            };
            Some((name, literal))
        })
        .collect()
}

/// `String.fromCharCode` over a comma-separated list of code points.
fn from_char_codes(list: &str) -> Option<String> {
    list.split(',')
        .map(|n| n.trim().parse::<u32>().ok().and_then(char::from_u32))
        .collect()
}

fn b64_text(encoded: &str) -> Option<String> {
    let encoded = encoded.trim();
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(encoded.trim_end_matches('=')))
        .or_else(|_| general_purpose::URL_SAFE.decode(encoded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}

/// Locate the player script: the first inline block containing every marker.
pub fn find_player_script<'a>(html: &'a str, markers: &[String]) -> Option<&'a str> {
    SCRIPT_BLOCK
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|body| markers.iter().all(|marker| body.contains(marker.as_str())))
}

/// Decode all bootstrap fields from embed page HTML. Pure.
pub fn decode_bootstrap(html: &str, markers: &[String]) -> Result<EmbedBootstrap> {
    let script = find_player_script(html, markers)
        .ok_or_else(|| EmbedError::Decode("no script block contains the player markers".into()))?;

    let literals = scan_literals(script);
    debug!("Player script has {} literal assignments", literals.len());

    let missing = |what: &str| EmbedError::Decode(format!("no assignment for {}", what));

    let issued_at_epoch_secs = literals
        .iter()
        .find_map(|(_, l)| match l {
            Literal::Int(digits) if digits.len() >= 9 => digits.parse::<i64>().ok(),
            _ => None,
        })
        .ok_or_else(|| missing("timestamp"))?;

    let decoded_b64: Vec<String> = literals
        .iter()
        .filter_map(|(_, l)| match l {
            Literal::Base64(s) => b64_text(s),
            _ => None,
        })
        .collect();
    let token_base_url = decoded_b64
        .iter()
        .find(|s| is_http_url(s))
        .cloned()
        .ok_or_else(|| missing("token base url"))?;
    let csrf_auth_value = decoded_b64
        .iter()
        .find(|s| !is_http_url(s) && !s.is_empty())
        .cloned()
        .ok_or_else(|| missing("csrf value"))?;

    let mut manifest_url_template = None;
    let mut initial_access_code = None;
    for (_, literal) in &literals {
        if let Literal::CharCodes(text) = literal {
            let url = b64_text(text).and_then(|inner| b64_text(&inner));
            match url {
                Some(url) if is_http_url(&url) && manifest_url_template.is_none() => {
                    manifest_url_template = Some(url);
                }
                _ if initial_access_code.is_none() && !text.is_empty() => {
                    initial_access_code = Some(text.clone());
                }
                _ => {}
            }
        }
    }
    let manifest_url_template = manifest_url_template.ok_or_else(|| missing("manifest url"))?;
    let initial_access_code = initial_access_code.ok_or_else(|| missing("access code"))?;

    let strings: Vec<&str> = literals
        .iter()
        .filter_map(|(_, l)| match l {
            Literal::Str(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();

    let host_id = strings
        .iter()
        .find(|s| s.len() <= 64 && HOST_ID.is_match(s))
        .map(|s| s.to_string())
        .ok_or_else(|| missing("host id"))?;

    let tokens: Vec<&str> = strings
        .iter()
        .copied()
        .filter(|s| ALNUM_TOKEN.is_match(s))
        .collect();
    let mut stream_idx = None;
    for (i, t) in tokens.iter().enumerate() {
        if stream_idx.is_none_or(|j: usize| t.len() > tokens[j].len()) {
            stream_idx = Some(i);
        }
    }
    let stream_idx = stream_idx.ok_or_else(|| missing("stream id"))?;
    let device_id = tokens
        .iter()
        .enumerate()
        .find(|(i, _)| *i != stream_idx)
        .map(|(_, t)| t.to_string())
        .ok_or_else(|| missing("device id"))?;

    Ok(EmbedBootstrap {
        device_id,
        stream_id: tokens[stream_idx].to_string(),
        host_id,
        initial_access_code,
        csrf_auth_value,
        token_base_url,
        manifest_url_template,
        issued_at_epoch_secs,
    })
}

/// Fetch the embed page (with the event page as Referer) and decode it.
pub async fn fetch_bootstrap(
    client: &Client,
    params: &EmbedParams,
    embed_path: &str,
    user_agent: &str,
    markers: &[String],
) -> Result<EmbedBootstrap> {
    let url = format!(
        "{}{}?{}",
        params.embed_origin,
        embed_path,
        params.session_query()
    );
    info!("Fetching embed bootstrap: {}", url);

    let response = client
        .get(&url)
        .header(header::USER_AGENT, user_agent)
        .header(header::REFERER, &params.event_page_url)
        .send()
        .await?;
    let html = ensure_page_ok(response, "embed")?.text().await?;

    decode_bootstrap(&html, markers)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use base64::{Engine as _, engine::general_purpose};

    pub fn char_codes(s: &str) -> String {
        let codes: Vec<String> = s.chars().map(|c| (c as u32).to_string()).collect();
        format!("[{}]", codes.join(","))
    }

    pub fn b64(s: &str) -> String {
        general_purpose::STANDARD.encode(s)
    }

    /// An embed page in the provider's shape.
    pub fn embed_page(
        device_id: &str,
        access_code: &str,
        token_base_url: &str,
        manifest_url: &str,
        ts: i64,
    ) -> String {
        format!(
            r#"<html><body>
<script src="/static/player.js"></script>
<script>
  window.analytics = {{ enabled: false }};
</script>
<script>
  var playerLoaded = false;
  var d = "{device_id}";
  var k = "7f3c9a1b5e2d8f4a6c0b9e1d3f5a7c9e";
  var h = "edge-eu-04";
  var r = {codes};
  var t = {ts};
  var c = atob("{csrf}");
  var u = atob("{token}");
  var m = String.fromCharCode(...{manifest});
  function boot() {{ if (!playerLoaded) {{ window.scode = r; playerLoaded = true; }} }}
</script>
</body></html>"#,
            codes = char_codes(access_code),
            csrf = b64("csrf-6a1f0e"),
            token = b64(token_base_url),
            manifest = char_codes(&b64(&b64(manifest_url))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn markers() -> Vec<String> {
        vec!["playerLoaded".to_string(), "scode".to_string()]
    }

    #[test]
    fn decodes_all_fields() {
        let html = embed_page(
            "a8Xk2pQ9",
            "ac-771",
            "https://token.example/refresh",
            "https://cdn.example/hls/SIG123abc/1700000000/index.m3u8",
            1_700_000_000,
        );

        let boot = decode_bootstrap(&html, &markers()).unwrap();
        assert_eq!(boot.device_id, "a8Xk2pQ9");
        assert_eq!(boot.stream_id, "7f3c9a1b5e2d8f4a6c0b9e1d3f5a7c9e");
        assert_eq!(boot.host_id, "edge-eu-04");
        assert_eq!(boot.initial_access_code, "ac-771");
        assert_eq!(boot.issued_at_epoch_secs, 1_700_000_000);
        assert_eq!(boot.csrf_auth_value, "csrf-6a1f0e");
        assert_eq!(boot.token_base_url, "https://token.example/refresh");
        assert_eq!(
            boot.manifest_url_template,
            "https://cdn.example/hls/SIG123abc/1700000000/index.m3u8"
        );
    }

    #[test]
    fn ignores_scripts_without_markers() {
        let html = r#"<script>var d = "abcdef12"; var t = 1700000000;</script>"#;
        assert!(matches!(
            decode_bootstrap(html, &markers()),
            Err(EmbedError::Decode(_))
        ));
    }

    #[test]
    fn missing_field_fails_whole_decode() {
        let html = embed_page("a8Xk2pQ9", "ac", "https://t/x", "https://m/x.m3u8", 1_700_000_000)
            .replace("var h = \"edge-eu-04\";", "");
        match decode_bootstrap(&html, &markers()) {
            Err(EmbedError::Decode(msg)) => assert!(msg.contains("host id")),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn char_codes_follow_from_char_code() {
        assert_eq!(from_char_codes("104, 105").as_deref(), Some("hi"));
        assert_eq!(from_char_codes("1114112"), None);
    }

    #[test]
    fn property_access_is_not_an_assignment() {
        let lits = scan_literals(r#"obj.x = "nope"; y = "yes""#);
        assert_eq!(lits.len(), 1);
        assert_eq!(lits[0].0, "y");
    }

    #[test]
    fn freshness_window() {
        let boot = decode_bootstrap(
            &embed_page("a8Xk2pQ9", "ac", "https://t/x", "https://m/x.m3u8", 1_000_000_000),
            &markers(),
        )
        .unwrap();
        assert!(boot.is_fresh(1_000_000_015, 25));
        assert!(!boot.is_fresh(1_000_000_040, 25));
    }
}
