use crate::error::{ManifestError, Result};
use m3u8_rs::{Playlist, parse_playlist_res};
use tracing::debug;

/// Check that a fetched body is an HLS playlist.
///
/// The parsed form is only used for validation; rewriting works on the raw
/// text so unknown tags and formatting survive untouched.
pub fn validate_playlist(content: &str) -> Result<Playlist> {
    if !content.trim_start_matches('\u{feff}').starts_with("#EXTM3U") {
        return Err(ManifestError::NotAPlaylist("missing #EXTM3U header".to_string()).into());
    }

    match parse_playlist_res(content.as_bytes()) {
        Ok(playlist) => {
            match &playlist {
                Playlist::MasterPlaylist(m) => {
                    debug!("Parsed master playlist with {} variants", m.variants.len())
                }
                Playlist::MediaPlaylist(m) => {
                    debug!("Parsed media playlist with {} segments", m.segments.len())
                }
            }
            Ok(playlist)
        }
        Err(e) => Err(ManifestError::NotAPlaylist(format!("{:?}", e)).into()),
    }
}
