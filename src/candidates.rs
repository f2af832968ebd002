//! Classification and storage of media URLs observed while a post renders.

use std::collections::BTreeSet;
use std::sync::{LazyLock, Mutex};

use log::debug;
use regex::Regex;
use serde_json::Value;
use url::Url;

/// Hosts that serve the actual video bytes.
pub const MEDIA_HOSTS: [&str; 2] = ["video.twimg.com", "video.x.com"];

/// Hosts and paths whose JSON bodies describe a post's media variants.
pub const API_PATTERNS: [&str; 5] = [
    "api.twitter.com",
    "api.x.com",
    "/i/api/",
    "graphql",
    "cdn.syndication.twimg.com",
];

const MEDIA_EXTENSIONS: [&str; 2] = [".mp4", ".m3u8"];
const SEGMENT_SUFFIXES: [&str; 3] = [".m4s", ".ts", ".aac"];
const VIDEO_TAGS: [&str; 4] = ["/avc1/", "/hevc/", "/vid/", "/video/"];
const AUDIO_TAGS: [&str; 3] = ["/mp4a/", "/aud/", "/audio/"];

/// Byte-range directories of fragmented streams, `/<start>/<end>/<WxH>/`,
/// and the init box that precedes their first fragment.
static FRAGMENT_MP4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:/\d+/\d+/\d+x\d+/[^/]+|(?:^|/)init(?:[-_.][^/]*)?)\.mp4$")
        .expect("valid fragment pattern")
});

/// Recursion limit for the JSON scanner.
pub const MAX_SCAN_DEPTH: usize = 64;
/// Upper bound on the number of JSON nodes visited in one scan.
pub const MAX_SCAN_NODES: usize = 200_000;

/// The bucket a URL lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// A complete MP4 that can be fetched with one request.
    DirectFile,
    /// An HLS playlist.
    Manifest,
    /// A playlist whose path says it carries video.
    VideoStream,
    /// A playlist whose path says it carries audio.
    AudioStream,
}

/// The four buckets of a discovery session, copied out of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    pub direct_files: BTreeSet<String>,
    pub manifests: BTreeSet<String>,
    pub video_streams: BTreeSet<String>,
    pub audio_streams: BTreeSet<String>,
}

impl Candidates {
    /// Whether any bucket holds something playable on its own.
    pub fn has_video(&self) -> bool {
        self.direct_files.iter().any(|url| !is_segment(url))
            || !self.manifests.is_empty()
            || !self.video_streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.direct_files.len()
            + self.manifests.len()
            + self.video_streams.len()
            + self.audio_streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_mut(&mut self, kind: MediaKind) -> &mut BTreeSet<String> {
        match kind {
            MediaKind::DirectFile => &mut self.direct_files,
            MediaKind::Manifest => &mut self.manifests,
            MediaKind::VideoStream => &mut self.video_streams,
            MediaKind::AudioStream => &mut self.audio_streams,
        }
    }
}

/// Deduplicated store fed by the page observer.
///
/// Insertion only ever grows the sets, so concurrent response handlers can
/// record in any order without further coordination.
#[derive(Debug, Default)]
pub struct CandidateRegistry {
    inner: Mutex<Candidates>,
}

impl CandidateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `url` and inserts it into every bucket it belongs to.
    ///
    /// Returns the buckets the URL was placed in; unclassifiable URLs are ignored.
    pub fn record(&self, url: &str, content_type: Option<&str>) -> Vec<MediaKind> {
        let kinds = classify(url, content_type);
        if kinds.is_empty() {
            return kinds;
        }

        let mut candidates = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for kind in &kinds {
            if candidates.bucket_mut(*kind).insert(url.to_string()) {
                debug!("Discovered {:?} candidate: {}", kind, url);
            }
        }
        kinds
    }

    pub fn snapshot(&self) -> Candidates {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_video(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .has_video()
    }
}

/// Path of the URL in lower case, without query or fragment.
fn lowercase_path(url: &Url) -> String {
    url.path().to_ascii_lowercase()
}

/// Like [`lowercase_path`], but also accepts relative references.
fn loose_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => lowercase_path(&parsed),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase(),
    }
}

fn is_segment_path(path: &str) -> bool {
    SEGMENT_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) || FRAGMENT_MP4.is_match(path)
}

/// Whether the URL names one piece of a segmented transfer, init segments
/// included.
pub fn is_segment(url: &str) -> bool {
    is_segment_path(&loose_path(url))
}

/// Whether the URL names an HLS playlist.
pub fn is_manifest(url: &str) -> bool {
    loose_path(url).ends_with(".m3u8")
}

/// Whether the URL's path tags it as an audio-only rendition.
pub fn is_audio_tagged(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    AUDIO_TAGS.iter().any(|tag| lower.contains(tag))
}

fn is_video_tagged(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    VIDEO_TAGS.iter().any(|tag| lower.contains(tag))
}

/// Decides which buckets `url` belongs to.
///
/// Video-tagged playlists land in both the manifest and the video-stream
/// buckets. Audio-tagged playlists only land in the audio bucket so they are
/// never mistaken for a standalone video. Segments never count as files.
pub fn classify(url: &str, content_type: Option<&str>) -> Vec<MediaKind> {
    let Ok(parsed) = Url::parse(url) else {
        return Vec::new();
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return Vec::new();
    }

    let path = lowercase_path(&parsed);
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();

    let manifest = path.ends_with(".m3u8") || content_type.contains("mpegurl");
    if manifest {
        if is_audio_tagged(url) {
            return vec![MediaKind::AudioStream];
        }
        if is_video_tagged(url) {
            return vec![MediaKind::Manifest, MediaKind::VideoStream];
        }
        return vec![MediaKind::Manifest];
    }

    let segment = is_segment_path(&path)
        || content_type.starts_with("video/mp2t")
        || content_type.starts_with("video/iso.segment");
    let mp4 = path.ends_with(".mp4") || content_type.starts_with("video/mp4");
    if mp4 && !segment {
        return vec![MediaKind::DirectFile];
    }

    Vec::new()
}

/// Whether a response from `url` is worth deep-scanning for variant URLs.
pub fn is_api_url(url: &str) -> bool {
    API_PATTERNS.iter().any(|pattern| url.contains(pattern))
}

/// Whether a string found anywhere looks like a media URL.
pub fn looks_like_media(candidate: &str) -> bool {
    MEDIA_HOSTS.iter().any(|host| candidate.contains(host))
        && MEDIA_EXTENSIONS.iter().any(|ext| candidate.contains(ext))
}

/// Walks an arbitrary JSON value and collects every string that looks like a
/// media URL.
///
/// The walk stops descending past [`MAX_SCAN_DEPTH`] and gives up after
/// [`MAX_SCAN_NODES`] nodes.
pub fn scan_json(value: &Value) -> Vec<String> {
    let mut scanner = JsonScanner {
        found: Vec::new(),
        visited: 0,
    };
    scanner.visit(value, 0);
    scanner.found
}

struct JsonScanner {
    found: Vec<String>,
    visited: usize,
}

impl JsonScanner {
    fn visit(&mut self, value: &Value, depth: usize) {
        if depth > MAX_SCAN_DEPTH || self.visited >= MAX_SCAN_NODES {
            return;
        }
        self.visited += 1;

        match value {
            Value::String(text) => {
                if looks_like_media(text) && !self.found.iter().any(|url| url == text) {
                    self.found.push(text.clone());
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.visit(item, depth + 1);
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    self.visit(item, depth + 1);
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recording_twice_is_idempotent() {
        let registry = CandidateRegistry::new();
        let url = "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/1280x720/a.mp4?tag=12";
        registry.record(url, Some("video/mp4"));
        let once = registry.snapshot();
        registry.record(url, Some("video/mp4"));
        assert_eq!(once, registry.snapshot());
        assert_eq!(once.direct_files.len(), 1);
    }

    #[test]
    fn manifests_never_land_in_direct_files() {
        let registry = CandidateRegistry::new();
        registry.record(
            "https://video.twimg.com/ext_tw_video/1/pu/pl/master.m3u8?tag=12",
            Some("application/x-mpegURL"),
        );
        let snapshot = registry.snapshot();
        assert!(snapshot.direct_files.is_empty());
        assert_eq!(snapshot.manifests.len(), 1);
    }

    #[test]
    fn video_tagged_manifest_is_in_both_buckets() {
        let url = "https://video.twimg.com/ext_tw_video/1/pu/pl/avc1/1280x720/b.m3u8";
        assert_eq!(
            classify(url, None),
            vec![MediaKind::Manifest, MediaKind::VideoStream]
        );
    }

    #[test]
    fn audio_tagged_manifest_is_audio_only() {
        let url = "https://video.twimg.com/ext_tw_video/1/pu/pl/mp4a/128000/c.m3u8";
        assert_eq!(classify(url, None), vec![MediaKind::AudioStream]);
    }

    #[test]
    fn segments_are_not_direct_files() {
        assert!(classify("https://video.twimg.com/a/seg1.m4s", Some("video/mp4")).is_empty());
        assert!(classify("https://video.twimg.com/a/0/3000/seg.ts", None).is_empty());
        assert!(is_segment("https://video.twimg.com/a/seg1.m4s?x=1"));
    }

    #[test]
    fn fragmented_mp4_pieces_are_segments() {
        let init = "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/0/0/1280x720/init.mp4";
        let fragment = "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/0/3000/1280x720/b.mp4";
        assert!(classify(init, Some("video/mp4")).is_empty());
        assert!(classify(fragment, None).is_empty());
        assert!(is_segment(init));
        assert!(is_segment("init-v1.mp4"));
        assert!(!is_segment("https://video.twimg.com/v/initial.mp4"));

        let progressive = "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/1280x720/a.mp4?tag=12";
        assert_eq!(classify(progressive, None), vec![MediaKind::DirectFile]);
        assert!(!is_segment(progressive));
    }

    #[test]
    fn audio_and_segments_are_not_playable_alone() {
        let registry = CandidateRegistry::new();
        registry.record(
            "https://video.twimg.com/ext_tw_video/1/pu/pl/mp4a/128000/c.m3u8",
            None,
        );
        registry.record("https://video.twimg.com/a/seg1.m4s", Some("video/mp4"));
        assert!(!registry.has_video());

        registry.record("https://video.twimg.com/ext_tw_video/1/pu/pl/master.m3u8", None);
        assert!(registry.has_video());
    }

    #[test]
    fn content_type_alone_can_classify() {
        assert_eq!(
            classify("https://video.twimg.com/stream?id=7", Some("video/mp4")),
            vec![MediaKind::DirectFile]
        );
        assert_eq!(
            classify(
                "https://video.twimg.com/playlist?id=7",
                Some("application/vnd.apple.mpegurl")
            ),
            vec![MediaKind::Manifest]
        );
    }

    #[test]
    fn malformed_and_non_http_urls_are_ignored() {
        let registry = CandidateRegistry::new();
        assert!(registry.record("not a url.mp4", None).is_empty());
        assert!(registry.record("blob:https://x.com/abc", Some("video/mp4")).is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn scanner_finds_nested_variants() {
        let body = json!({
            "data": {
                "tweetResult": {
                    "result": {
                        "legacy": {
                            "extended_entities": {
                                "media": [{
                                    "video_info": {
                                        "variants": [
                                            {"bitrate": 832000, "url": "https://video.twimg.com/v/vid/avc1/640x360/a.mp4?tag=12"},
                                            {"content_type": "application/x-mpegURL", "url": "https://video.twimg.com/v/pl/b.m3u8?tag=12"},
                                            {"url": "https://pbs.twimg.com/media/thumb.jpg"}
                                        ]
                                    }
                                }]
                            }
                        }
                    }
                }
            }
        });

        let found = scan_json(&body);
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|u| u.ends_with("a.mp4?tag=12")));
        assert!(found.iter().any(|u| u.ends_with("b.m3u8?tag=12")));
    }

    #[test]
    fn scanner_stops_at_depth_limit() {
        let mut value = json!("https://video.twimg.com/deep.mp4");
        for _ in 0..(MAX_SCAN_DEPTH + 10) {
            value = json!([value]);
        }
        assert!(scan_json(&value).is_empty());

        let mut shallow = json!("https://video.twimg.com/shallow.mp4");
        for _ in 0..10 {
            shallow = json!({ "next": shallow });
        }
        assert_eq!(scan_json(&shallow).len(), 1);
    }
}
