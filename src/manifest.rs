//! Signed manifest request construction and fetching.

use crate::error::{EmbedError, ManifestError, Result};
use crate::hls::parser;
use reqwest::{Client, StatusCode, header};
use tracing::{info, warn};
use url::Url;

/// Query parameter carrying the device id.
pub const DEVICE_PARAM: &str = "u_id";

/// Set `u_id` on a signed manifest URL.
///
/// Works on the raw string so the path (which carries the signature) and
/// every other query pair survive byte-for-byte. An existing `u_id` is
/// replaced in place of the first occurrence; otherwise it is appended.
/// The template is validated but never re-serialized.
pub fn build_manifest_url(template: &str, device_id: &str) -> Result<String> {
    Url::parse(template)?;

    let (without_fragment, fragment) = match template.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (template, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, query),
        None => (without_fragment, ""),
    };

    let device_pair = format!("{}={}", DEVICE_PARAM, urlencoding::encode(device_id));
    let mut pairs: Vec<String> = Vec::new();
    let mut replaced = false;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let key = pair.split_once('=').map_or(pair, |(k, _)| k);
        if key == DEVICE_PARAM {
            if !replaced {
                pairs.push(device_pair.clone());
                replaced = true;
            }
        } else {
            pairs.push(pair.to_string());
        }
    }
    if !replaced {
        pairs.push(device_pair);
    }

    let mut out = format!("{}?{}", base, pairs.join("&"));
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    Ok(out)
}

/// The fetched playlist and the URL it was served from.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub url: Url,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: Client,
}

impl ManifestResolver {
    /// `client` must not carry a cookie store.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// GET the manifest with `Origin`/`Referer` only.
    pub async fn fetch(&self, url: &str, embed_origin: &str) -> Result<FetchedManifest> {
        info!("Fetching manifest: {}", url);

        let response = self
            .client
            .get(url)
            .header(header::ORIGIN, embed_origin)
            .header(header::REFERER, format!("{}/", embed_origin.trim_end_matches('/')))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                warn!("Manifest 401: signature expired or stale u_id");
                return Err(ManifestError::Unauthorized.into());
            }
            StatusCode::PRECONDITION_FAILED => {
                warn!("Manifest 412: Referer rejected");
                return Err(ManifestError::PreconditionFailed.into());
            }
            other => {
                warn!("Manifest fetch returned {}", other);
                return Err(ManifestError::Status(other.as_u16()).into());
            }
        }

        let final_url = response.url().clone();
        let body = response.text().await.map_err(EmbedError::Http)?;
        parser::validate_playlist(&body)?;

        Ok(FetchedManifest {
            url: final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const SIGNED: &str =
        "https://cdn.example/hls/aGFzaD0xMjM0NTY3OA==/1700000030/%7Eedge/index.m3u8";

    fn path_of(url: &str) -> &str {
        let rest = url.split_once("://").unwrap().1;
        let start = rest.find('/').unwrap();
        let end = rest.find('?').unwrap_or(rest.len());
        &rest[start..end]
    }

    fn query_of(url: &str) -> Option<&str> {
        url.split_once('?').map(|(_, q)| q)
    }

    #[test]
    fn appends_device_param() {
        let url = build_manifest_url(SIGNED, "dev123").unwrap();
        assert_eq!(url, format!("{}?u_id=dev123", SIGNED));
    }

    #[test]
    fn overwrites_existing_device_param_only() {
        let template = format!("{}?a=1&u_id=old&b=x%2Fy&u_id=dup", SIGNED);
        let url = build_manifest_url(&template, "new").unwrap();
        assert_eq!(query_of(&url), Some("a=1&u_id=new&b=x%2Fy"));
        assert_eq!(path_of(&url), path_of(SIGNED));
    }

    #[test]
    fn signed_path_is_stable_across_device_ids() {
        let templates = [
            SIGNED,
            "https://cdn.example/hls/a/./SIG/../x/index.m3u8",
            "https://cdn.example/hls/{sig}/a%2fb/index.m3u8",
            "https://cdn.example/hls/AbC+/=/index.m3u8?exp=1700000030#t=0",
        ];
        for template in templates {
            for device in ["a", "b-c", "dev with space", "ünï"] {
                let url = build_manifest_url(template, device).unwrap();
                assert_eq!(path_of(&url), path_of(template), "path of {}", template);
                assert!(url.starts_with(template.split('?').next().unwrap()));

                let pairs: Vec<(String, String)> = Url::parse(&url)
                    .unwrap()
                    .query_pairs()
                    .into_owned()
                    .filter(|(k, _)| k == DEVICE_PARAM)
                    .collect();
                assert_eq!(pairs, vec![("u_id".to_string(), device.to_string())]);
            }
        }
    }

    #[test]
    fn keeps_fragment_after_query() {
        let url = build_manifest_url("https://cdn.example/hls/SIG/i.m3u8?exp=1#t=0", "d").unwrap();
        assert_eq!(url, "https://cdn.example/hls/SIG/i.m3u8?exp=1&u_id=d#t=0");
    }

    #[test]
    fn rejects_unparseable_template() {
        assert!(matches!(
            build_manifest_url("not a url", "d"),
            Err(EmbedError::InvalidUrl(_))
        ));
    }

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg1.ts\n";

    #[tokio::test]
    async fn fetch_sends_origin_and_referer_without_csrf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hls/sig/index.m3u8"))
            .and(query_param("u_id", "dev"))
            .and(header_eq("origin", "https://embed.example"))
            .and(header_eq("referer", "https://embed.example/"))
            .respond_with(move |req: &Request| {
                if req.headers.contains_key("x-csrf-auth") || req.headers.contains_key("cookie") {
                    ResponseTemplate::new(400)
                } else {
                    ResponseTemplate::new(200).set_body_string(PLAYLIST)
                }
            })
            .expect(1)
            .mount(&server)
            .await;

        let url =
            build_manifest_url(&format!("{}/hls/sig/index.m3u8", server.uri()), "dev").unwrap();
        let fetched = ManifestResolver::new(Client::new())
            .fetch(&url, "https://embed.example")
            .await
            .unwrap();
        assert!(fetched.body.starts_with("#EXTM3U"));
    }

    #[tokio::test]
    async fn maps_401_and_412() {
        let server = MockServer::start().await;
        Mock::given(path("/expired.m3u8"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(path("/noref.m3u8"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let resolver = ManifestResolver::new(Client::new());
        let expired = format!("{}/expired.m3u8", server.uri());
        let noref = format!("{}/noref.m3u8", server.uri());

        assert!(matches!(
            resolver.fetch(&expired, "https://e").await,
            Err(EmbedError::Manifest(ManifestError::Unauthorized))
        ));
        assert!(matches!(
            resolver.fetch(&noref, "https://e").await,
            Err(EmbedError::Manifest(ManifestError::PreconditionFailed))
        ));
    }

    #[tokio::test]
    async fn rejects_non_playlist_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .mount(&server)
            .await;

        let url = format!("{}/x.m3u8", server.uri());
        assert!(matches!(
            ManifestResolver::new(Client::new()).fetch(&url, "https://e").await,
            Err(EmbedError::Manifest(ManifestError::NotAPlaylist(_)))
        ));
    }
}
