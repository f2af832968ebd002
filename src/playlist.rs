//! Fetching HLS manifests and expanding their references.

use log::debug;
use m3u8_rs::{AlternativeMediaType, Playlist};
use url::Url;

use crate::error::{Error, Result};
use crate::quality::QualityTier;

/// One video rendition listed by a master playlist, with absolute URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    /// The audio rendition of the variant's audio group, if it has its own URI.
    pub audio: Option<String>,
}

/// A parsed manifest whose references have been made absolute.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPlaylist {
    /// Variants sorted by bandwidth, best first.
    Master(Vec<Variant>),
    /// Segment URLs in playback order.
    Media(Vec<String>),
}

impl ResolvedPlaylist {
    /// Picks the variant for `tier`, using the same indexing as direct files.
    pub fn variant(&self, tier: QualityTier) -> Option<&Variant> {
        match self {
            ResolvedPlaylist::Master(variants) => {
                tier.index(variants.len()).and_then(|i| variants.get(i))
            }
            ResolvedPlaylist::Media(_) => None,
        }
    }
}

/// Downloads and resolves the manifest at `url`.
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<ResolvedPlaylist> {
    debug!("Fetching playlist {}", url);
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Transfer {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = response.bytes().await?;
    resolve(&Url::parse(url)?, &bytes)
}

/// Parses a manifest body and joins every reference against `base`.
pub fn resolve(base: &Url, body: &[u8]) -> Result<ResolvedPlaylist> {
    let playlist = m3u8_rs::parse_playlist_res(body)
        .map_err(|e| Error::Playlist(format!("{}: {:?}", base, e)))?;

    match playlist {
        Playlist::MasterPlaylist(master) => {
            let mut variants = Vec::with_capacity(master.variants.len());
            for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
                let audio = match &variant.audio {
                    Some(group) => master
                        .alternatives
                        .iter()
                        .filter(|alt| {
                            alt.media_type == AlternativeMediaType::Audio && &alt.group_id == group
                        })
                        .filter_map(|alt| alt.uri.as_deref())
                        .next()
                        .map(|uri| base.join(uri))
                        .transpose()?
                        .map(String::from),
                    None => None,
                };

                variants.push(Variant {
                    uri: base.join(&variant.uri)?.to_string(),
                    bandwidth: variant.bandwidth,
                    resolution: variant.resolution.as_ref().map(|r| (r.width, r.height)),
                    audio,
                });
            }
            variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
            Ok(ResolvedPlaylist::Master(variants))
        }
        Playlist::MediaPlaylist(media) => {
            let segments = media
                .segments
                .iter()
                .map(|segment| base.join(&segment.uri).map(String::from))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ResolvedPlaylist::Media(segments))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MEDIA:NAME=\"Audio\",TYPE=AUDIO,GROUP-ID=\"audio-128000\",AUTOSELECT=YES,URI=\"/ext_tw_video/1/pu/pl/mp4a/128000/a.m3u8\"
#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=300000,BANDWIDTH=400000,RESOLUTION=480x270,CODECS=\"mp4a.40.2,avc1.4d001e\",AUDIO=\"audio-128000\"
/ext_tw_video/1/pu/pl/avc1/480x270/lo.m3u8
#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=2000000,BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"mp4a.40.2,avc1.640020\",AUDIO=\"audio-128000\"
/ext_tw_video/1/pu/pl/avc1/1280x720/hi.m3u8
#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=800000,BANDWIDTH=950000,RESOLUTION=640x360,CODECS=\"mp4a.40.2,avc1.4d001f\",AUDIO=\"audio-128000\"
/ext_tw_video/1/pu/pl/avc1/640x360/mid.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:6
#EXT-X-TARGETDURATION:3
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:3.000,
seg0.m4s
#EXTINF:3.000,
sub/seg1.m4s
#EXTINF:1.500,
https://cdn.example.com/abs/seg2.m4s
#EXT-X-ENDLIST
";

    #[test]
    fn master_variants_are_sorted_and_absolute() {
        let base = Url::parse("https://video.twimg.com/ext_tw_video/1/pu/pl/master.m3u8?tag=12")
            .unwrap();
        let resolved = resolve(&base, MASTER.as_bytes()).unwrap();

        let ResolvedPlaylist::Master(variants) = &resolved else {
            panic!("expected a master playlist");
        };
        assert_eq!(variants.len(), 3);
        assert_eq!(
            variants[0].uri,
            "https://video.twimg.com/ext_tw_video/1/pu/pl/avc1/1280x720/hi.m3u8"
        );
        assert_eq!(variants[0].resolution, Some((1280, 720)));
        assert_eq!(
            variants[0].audio.as_deref(),
            Some("https://video.twimg.com/ext_tw_video/1/pu/pl/mp4a/128000/a.m3u8")
        );

        let lowest = resolved.variant(QualityTier::Lowest).unwrap();
        assert!(lowest.uri.ends_with("lo.m3u8"));
        let medium = resolved.variant(QualityTier::Medium).unwrap();
        assert!(medium.uri.ends_with("mid.m3u8"));
    }

    #[test]
    fn media_segments_are_joined_against_the_manifest() {
        let base = Url::parse("https://video.twimg.com/v/pl/avc1/640x360/x.m3u8").unwrap();
        let resolved = resolve(&base, MEDIA.as_bytes()).unwrap();
        assert_eq!(
            resolved,
            ResolvedPlaylist::Media(vec![
                "https://video.twimg.com/v/pl/avc1/640x360/seg0.m4s".to_string(),
                "https://video.twimg.com/v/pl/avc1/640x360/sub/seg1.m4s".to_string(),
                "https://cdn.example.com/abs/seg2.m4s".to_string(),
            ])
        );
        assert!(resolved.variant(QualityTier::Highest).is_none());
    }

    #[test]
    fn garbage_is_a_playlist_error() {
        let base = Url::parse("https://video.twimg.com/x.m3u8").unwrap();
        let err = resolve(&base, b"<html>nope</html>").unwrap_err();
        assert!(matches!(err, Error::Playlist(_)));
    }
}
