//! Embed parameter extraction from a provider's event page.
//!
//! Page templates drift independently per provider, so every field is
//! matched by an ordered list of named rules. The first rule that matches
//! wins, and each rule tracks its own hit/miss counts so a broken pattern
//! shows up in `/health` and metrics before it shows up as failed playback.

use crate::error::{EmbedError, Result};
use regex::Regex;
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Identifies which event page to scrape for one playback request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedSession {
    pub source_site_id: String,
    pub event_path: String,
    pub link_index: u32,
}

impl EmbedSession {
    pub fn event_page_url(&self, provider_base: &str) -> String {
        format!(
            "{}/{}-{}",
            provider_base.trim_end_matches('/'),
            self.event_path.trim_start_matches('/'),
            self.link_index
        )
    }
}

/// Fields scraped from the event page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamField {
    ViewId,
    PageId,
    EmbedHost,
    CsrfToken,
    CsrfTokenIp,
}

impl ParamField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamField::ViewId => "view_id",
            ParamField::PageId => "page_id",
            ParamField::EmbedHost => "embed_host",
            ParamField::CsrfToken => "csrf_token",
            ParamField::CsrfTokenIp => "csrf_token_ip",
        }
    }
}

/// Session identifiers needed to address the embed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedParams {
    pub view_id: String,
    pub page_id: u64,
    /// Scheme + host of the embed domain, e.g. `https://embed.example`.
    pub embed_origin: String,
    pub csrf_token: String,
    pub csrf_token_ip: String,
    pub event_page_url: String,
}

impl EmbedParams {
    /// Query string used to request the embed bootstrap page.
    pub fn session_query(&self) -> String {
        format!(
            "id={}&sid={}&csrf={}&csrf_ip={}",
            self.page_id,
            urlencoding::encode(&self.view_id),
            urlencoding::encode(&self.csrf_token),
            urlencoding::encode(&self.csrf_token_ip)
        )
    }
}

/// One named pattern for one field. Capture group 1 is the value.
#[derive(Debug)]
pub struct ExtractionRule {
    pub name: String,
    pub field: ParamField,
    pattern: Regex,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExtractionRule {
    pub fn new(name: &str, field: ParamField, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| EmbedError::Internal(format!("invalid rule {}: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            field,
            pattern,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn apply(&self, html: &str) -> Option<String> {
        let value = self
            .pattern
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty());

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        crate::metrics::record_rule(&self.name, value.is_some());
        value
    }
}

/// Snapshot of a rule's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub name: String,
    pub field: ParamField,
    pub hits: u64,
    pub misses: u64,
}

/// Ordered rule list. Rules for a field are tried in insertion order.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    rules: Arc<Vec<ExtractionRule>>,
}

impl StrategyRegistry {
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }

    /// Inline `const` assignments first, then JSON config blobs, then markup.
    pub fn with_default_rules() -> Result<Self> {
        let rules = vec![
            ExtractionRule::new(
                "const-view-id",
                ParamField::ViewId,
                r#"const\s+VIEW_ID\s*=\s*["']([^"']+)["']"#,
            )?,
            ExtractionRule::new(
                "json-view-id",
                ParamField::ViewId,
                r#""(?:viewId|view_id|sessionId)"\s*:\s*"([^"]+)""#,
            )?,
            ExtractionRule::new(
                "const-page-id",
                ParamField::PageId,
                r#"const\s+PAGE_ID\s*=\s*["']?(\d+)"#,
            )?,
            ExtractionRule::new(
                "json-page-id",
                ParamField::PageId,
                r#""(?:pageId|page_id)"\s*:\s*"?(\d+)"#,
            )?,
            ExtractionRule::new(
                "const-embed-host",
                ParamField::EmbedHost,
                r#"const\s+EMBED_HOST\s*=\s*["']([^"']+)["']"#,
            )?,
            ExtractionRule::new(
                "json-embed-host",
                ParamField::EmbedHost,
                r#""(?:embedHost|embed_host|embedDomain)"\s*:\s*"([^"]+)""#,
            )?,
            ExtractionRule::new(
                "iframe-embed-host",
                ParamField::EmbedHost,
                r#"<iframe[^>]+src=["'](https?://[^/"']+)/"#,
            )?,
            ExtractionRule::new(
                "const-csrf",
                ParamField::CsrfToken,
                r#"const\s+CSRF_TOKEN\s*=\s*["']([^"']+)["']"#,
            )?,
            ExtractionRule::new(
                "json-csrf",
                ParamField::CsrfToken,
                r#""(?:csrf|csrfToken)"\s*:\s*"([^"]+)""#,
            )?,
            ExtractionRule::new(
                "const-csrf-ip",
                ParamField::CsrfTokenIp,
                r#"const\s+CSRF_TOKEN_IP\s*=\s*["']([^"']+)["']"#,
            )?,
            ExtractionRule::new(
                "json-csrf-ip",
                ParamField::CsrfTokenIp,
                r#""(?:csrfIp|csrf_ip|csrfTokenIp)"\s*:\s*"([^"]+)""#,
            )?,
        ];
        Ok(Self::new(rules))
    }

    fn find(&self, field: ParamField, html: &str) -> Option<String> {
        for rule in self.rules.iter().filter(|r| r.field == field) {
            if let Some(value) = rule.apply(html) {
                debug!("Rule '{}' matched {}", rule.name, field.as_str());
                return Some(value);
            }
        }
        None
    }

    pub fn stats(&self) -> Vec<RuleStats> {
        self.rules
            .iter()
            .map(|r| RuleStats {
                name: r.name.clone(),
                field: r.field,
                hits: r.hits.load(Ordering::Relaxed),
                misses: r.misses.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Pull every required field out of the event page HTML.
    pub fn extract(&self, html: &str, event_page_url: &str) -> Result<EmbedParams> {
        let get = |field: ParamField| {
            self.find(field, html).ok_or_else(|| {
                warn!("No extraction rule matched {}", field.as_str());
                EmbedError::Extraction(field.as_str().to_string())
            })
        };

        let view_id = get(ParamField::ViewId)?;
        let page_id = get(ParamField::PageId)?
            .parse::<u64>()
            .map_err(|_| EmbedError::Extraction(ParamField::PageId.as_str().to_string()))?;
        let embed_host = get(ParamField::EmbedHost)?;
        let csrf_token = get(ParamField::CsrfToken)?;
        let csrf_token_ip = get(ParamField::CsrfTokenIp)?;

        Ok(EmbedParams {
            view_id,
            page_id,
            embed_origin: normalize_origin(&embed_host),
            csrf_token,
            csrf_token_ip,
            event_page_url: event_page_url.to_string(),
        })
    }
}

/// Bare hostnames are assumed to be served over https.
fn normalize_origin(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host.trim_start_matches("//"))
    }
}

/// Map a non-success page status to `EmbedError::PageStatus`.
pub(crate) fn ensure_page_ok(response: Response, page: &'static str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    warn!("{} page {} returned {}", page, response.url(), status);
    Err(EmbedError::PageStatus {
        page,
        status: status.as_u16(),
    })
}

/// Fetch the event page and extract embed parameters from it.
pub async fn fetch_embed_params(
    client: &Client,
    registry: &StrategyRegistry,
    provider_base: &str,
    user_agent: &str,
    session: &EmbedSession,
) -> Result<EmbedParams> {
    let url = session.event_page_url(provider_base);
    info!("Fetching event page: {}", url);

    let response = client
        .get(&url)
        .header(header::USER_AGENT, user_agent)
        .header(header::REFERER, provider_base)
        .send()
        .await?;
    let html = ensure_page_ok(response, "event")?.text().await?;

    registry.extract(&html, &url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONST_PAGE: &str = r#"
        <html><head><script>
          const VIEW_ID = "v-8f2a91";
          const PAGE_ID = 44021;
          const EMBED_HOST = "embed.example.net";
          const CSRF_TOKEN = "c5rf-abc";
          const CSRF_TOKEN_IP = "c5rf-ip-xyz";
        </script></head></html>
    "#;

    const JSON_PAGE: &str = r#"
        <script id="cfg" type="application/json">
          {"viewId":"jv-1","pageId":"77","embedHost":"https://player.example.org","csrf":"j-csrf","csrfIp":"j-csrf-ip"}
        </script>
    "#;

    #[test]
    fn extracts_const_assignments() {
        let registry = StrategyRegistry::with_default_rules().unwrap();
        let params = registry
            .extract(CONST_PAGE, "https://provider.example/event-1")
            .unwrap();
        assert_eq!(params.view_id, "v-8f2a91");
        assert_eq!(params.page_id, 44021);
        assert_eq!(params.embed_origin, "https://embed.example.net");
        assert_eq!(params.csrf_token, "c5rf-abc");
        assert_eq!(params.csrf_token_ip, "c5rf-ip-xyz");
    }

    #[test]
    fn falls_back_to_json_blob() {
        let registry = StrategyRegistry::with_default_rules().unwrap();
        let params = registry.extract(JSON_PAGE, "u").unwrap();
        assert_eq!(params.view_id, "jv-1");
        assert_eq!(params.page_id, 77);
        assert_eq!(params.embed_origin, "https://player.example.org");
    }

    #[test]
    fn missing_field_names_the_field() {
        let registry = StrategyRegistry::with_default_rules().unwrap();
        let page = CONST_PAGE.replace("CSRF_TOKEN_IP", "SOMETHING_ELSE");
        match registry.extract(&page, "u") {
            Err(EmbedError::Extraction(field)) => assert_eq!(field, "csrf_token_ip"),
            other => panic!("expected extraction error, got {:?}", other),
        }
    }

    #[test]
    fn rule_stats_track_hits_and_misses() {
        let registry = StrategyRegistry::with_default_rules().unwrap();
        registry.extract(JSON_PAGE, "u").unwrap();

        let stats = registry.stats();
        let const_view = stats.iter().find(|s| s.name == "const-view-id").unwrap();
        let json_view = stats.iter().find(|s| s.name == "json-view-id").unwrap();
        assert_eq!((const_view.hits, const_view.misses), (0, 1));
        assert_eq!((json_view.hits, json_view.misses), (1, 0));
    }

    #[test]
    fn session_query_is_escaped() {
        let params = EmbedParams {
            view_id: "a b".into(),
            page_id: 5,
            embed_origin: "https://e".into(),
            csrf_token: "x/y".into(),
            csrf_token_ip: "z".into(),
            event_page_url: "u".into(),
        };
        assert_eq!(params.session_query(), "id=5&sid=a%20b&csrf=x%2Fy&csrf_ip=z");
    }

    #[test]
    fn event_page_url_joins_path_and_index() {
        let session = EmbedSession {
            source_site_id: "alpha".into(),
            event_path: "/live/match-123".into(),
            link_index: 2,
        };
        assert_eq!(
            session.event_page_url("https://provider.example/"),
            "https://provider.example/live/match-123-2"
        );
    }

    #[tokio::test]
    async fn event_page_status_is_classified() {
        use crate::error::FailureClass;
        use wiremock::matchers::path;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(path("/gone-0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/busy-0"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let registry = StrategyRegistry::with_default_rules().unwrap();
        let fetch = |event_path: &str| {
            let session = EmbedSession {
                source_site_id: "alpha".into(),
                event_path: event_path.into(),
                link_index: 0,
            };
            let client = Client::new();
            let registry = registry.clone();
            let base = server.uri();
            async move { fetch_embed_params(&client, &registry, &base, "ua", &session).await }
        };

        let gone = fetch("gone").await.unwrap_err();
        assert!(matches!(
            gone,
            EmbedError::PageStatus {
                page: "event",
                status: 404
            }
        ));
        assert_eq!(gone.class(), FailureClass::UnsupportedProvider);

        let busy = fetch("busy").await.unwrap_err();
        assert_eq!(busy.class(), FailureClass::TemporarilyUnavailable);
    }
}
