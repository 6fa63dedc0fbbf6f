//! Line-preserving manifest rewriting.
//!
//! Key, segment and nested playlist references are replaced with proxy
//! URLs of the form `{proxy_base}?url={encoded}&type={kind}`. Every other
//! byte of the playlist is copied through unchanged, including line endings
//! and tags this module does not understand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use url::Url;

/// Extensions that mark a bare line as a media reference. Some providers
/// disguise segments as images.
const MEDIA_EXTENSIONS: &[&str] = &[
    ".ts", ".m4s", ".mp4", ".m4a", ".m4v", ".aac", ".mp3", ".vtt", ".webvtt", ".cmfv", ".cmfa",
    ".fmp4", ".jpg", ".jpeg", ".png", ".webp",
];

/// Tags whose `URI` points at another playlist rather than media.
const PLAYLIST_TAGS: &[&str] = &[
    "#EXT-X-MEDIA",
    "#EXT-X-I-FRAME-STREAM-INF",
    "#EXT-X-RENDITION-REPORT",
];

const KEY_TAGS: &[&str] = &["#EXT-X-KEY", "#EXT-X-SESSION-KEY"];

/// What a proxied URL points at; sent as the proxy's `type` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Key,
    Segment,
    Playlist,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Key => "key",
            ResourceKind::Segment => "segment",
            ResourceKind::Playlist => "playlist",
        }
    }
}

/// A rewritten playlist plus counts of what was rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenManifest {
    pub body: String,
    pub keys: usize,
    pub segments: usize,
    pub playlists: usize,
    /// `host[:port]` of every upstream the rewritten references point at
    pub hosts: BTreeSet<String>,
}

/// `host[:port]` of `url`, the key proxied requests are grouped by.
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn record_host(hosts: &mut BTreeSet<String>, target: &str) {
    if let Some(host) = Url::parse(target).ok().as_ref().and_then(authority) {
        hosts.insert(host);
    }
}

pub fn proxy_url(proxy_base: &str, target: &str, kind: ResourceKind) -> String {
    format!(
        "{}?url={}&type={}",
        proxy_base,
        urlencoding::encode(target),
        kind.as_str()
    )
}

/// Resolve `uri` against the manifest URL. Absolute http(s) URIs are
/// returned verbatim; anything that does not resolve to http(s) is `None`.
fn resolve(base: &Url, uri: &str) -> Option<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Some(uri.to_string());
    }
    let joined = base.join(uri).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

fn classify_reference(line: &str) -> Option<ResourceKind> {
    let path = line.split(['?', '#']).next().unwrap_or(line).to_ascii_lowercase();
    if path.ends_with(".m3u8") {
        Some(ResourceKind::Playlist)
    } else if line.contains('?') || MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        Some(ResourceKind::Segment)
    } else {
        None
    }
}

fn classify_tag(line: &str) -> ResourceKind {
    let name = line.split(':').next().unwrap_or(line);
    if KEY_TAGS.contains(&name) {
        ResourceKind::Key
    } else if PLAYLIST_TAGS.contains(&name) {
        ResourceKind::Playlist
    } else {
        ResourceKind::Segment
    }
}

/// Replace every `URI="…"` attribute value in a tag line.
fn rewrite_uri_attributes(
    line: &str,
    base: &Url,
    proxy_base: &str,
    kind: ResourceKind,
    hosts: &mut BTreeSet<String>,
) -> (String, usize) {
    const MARKER: &str = "URI=\"";
    let mut out = String::with_capacity(line.len() + 64);
    let mut rest = line;
    let mut rewritten = 0;

    while let Some(idx) = rest.find(MARKER) {
        let at_attribute_start = idx == 0 || matches!(rest.as_bytes()[idx - 1], b':' | b',');
        let value_start = idx + MARKER.len();
        let Some(value_len) = rest[value_start..].find('"') else {
            break;
        };
        let value = &rest[value_start..value_start + value_len];

        out.push_str(&rest[..value_start]);
        match resolve(base, value).filter(|_| at_attribute_start) {
            Some(target) => {
                record_host(hosts, &target);
                out.push_str(&proxy_url(proxy_base, &target, kind));
                rewritten += 1;
            }
            None => out.push_str(value),
        }
        rest = &rest[value_start + value_len..];
    }
    out.push_str(rest);
    (out, rewritten)
}

/// Rewrite a raw playlist so keys, segments and child playlists go through
/// `proxy_base`. Line count and order are unchanged.
pub fn rewrite_manifest(raw: &str, manifest_url: &Url, proxy_base: &str) -> RewrittenManifest {
    let mut result = RewrittenManifest {
        body: String::with_capacity(raw.len() * 2),
        keys: 0,
        segments: 0,
        playlists: 0,
        hosts: BTreeSet::new(),
    };
    let mut hosts = BTreeSet::new();
    let mut count = |kind: ResourceKind, n: usize| match kind {
        ResourceKind::Key => result.keys += n,
        ResourceKind::Segment => result.segments += n,
        ResourceKind::Playlist => result.playlists += n,
    };

    let mut lines: Vec<String> = Vec::new();
    for raw_line in raw.split('\n') {
        let (line, cr) = match raw_line.strip_suffix('\r') {
            Some(stripped) => (stripped, "\r"),
            None => (raw_line, ""),
        };
        let trimmed = line.trim();

        let rewritten = if trimmed.is_empty() {
            None
        } else if trimmed.starts_with('#') {
            if line.contains("URI=\"") {
                let kind = classify_tag(trimmed);
                let (new_line, n) =
                    rewrite_uri_attributes(line, manifest_url, proxy_base, kind, &mut hosts);
                count(kind, n);
                Some(new_line)
            } else {
                None
            }
        } else {
            classify_reference(trimmed).and_then(|kind| {
                let target = resolve(manifest_url, trimmed)?;
                record_host(&mut hosts, &target);
                count(kind, 1);
                Some(proxy_url(proxy_base, &target, kind))
            })
        };

        lines.push(match rewritten {
            Some(new_line) => format!("{}{}", new_line, cr),
            None => raw_line.to_string(),
        });
    }

    result.body = lines.join("\n");
    result.hosts = hosts;
    debug!(
        "Rewrote manifest: {} keys, {} segments, {} playlists",
        result.keys, result.segments, result.playlists
    );
    result
}
