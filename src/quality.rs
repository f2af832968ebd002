//! Ranking of discovered variants and selection by requested quality.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::candidates::{self, Candidates};

/// Coarse quality preference, resolved against whatever was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Highest,
    High,
    Medium,
    Low,
    Lowest,
}

impl QualityTier {
    pub const NAMES: [&'static str; 5] = ["highest", "high", "medium", "low", "lowest"];

    /// Index into a list of `len` entries sorted best first.
    ///
    /// Tiers that need more entries than exist fall back to the nearest end.
    /// Returns `None` only for an empty list.
    pub fn index(self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let last = len - 1;
        Some(match self {
            QualityTier::Highest => 0,
            QualityTier::High => 1.min(last),
            QualityTier::Medium => len / 2,
            QualityTier::Low => last.saturating_sub(1),
            QualityTier::Lowest => last,
        })
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::Highest => "highest",
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
            QualityTier::Lowest => "lowest",
        };
        f.write_str(name)
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "highest" | "best" => Ok(QualityTier::Highest),
            "high" => Ok(QualityTier::High),
            "medium" => Ok(QualityTier::Medium),
            "low" => Ok(QualityTier::Low),
            "lowest" | "worst" => Ok(QualityTier::Lowest),
            other => Err(format!("unknown quality tier: {other}")),
        }
    }
}

/// The chosen video URL, and the audio URL to mux with it if one exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.video.is_none()
    }
}

static DIMENSIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2,4})x(\d{2,4})").expect("valid dimensions pattern"));
static P_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^0-9])(\d{3,4})p(?:[^a-z0-9]|$)").expect("valid resolution pattern")
});
static BITRATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:[?&/](?:bitrate|br)[=/]|/mp4a/)(\d+)").expect("valid bitrate pattern")
});

/// Ordinal score for a frame height.
fn height_rank(height: u64) -> u64 {
    match height {
        h if h >= 1080 => 5,
        h if h >= 720 => 4,
        h if h >= 480 => 3,
        h if h >= 360 => 2,
        _ => 1,
    }
}

/// Frame height named in the URL, short side for portrait variants.
fn height(url: &str) -> Option<u64> {
    if let Some(caps) = DIMENSIONS.captures(url) {
        let width: u64 = caps[1].parse().unwrap_or(0);
        let height: u64 = caps[2].parse().unwrap_or(0);
        return Some(width.min(height));
    }
    P_SUFFIX
        .captures(url)
        .map(|caps| caps[1].parse().unwrap_or(0))
}

fn bitrate(url: &str) -> Option<u64> {
    BITRATE
        .captures(url)
        .and_then(|caps| caps[1].parse().ok())
}

/// Quality score of a URL, derived from its syntax alone.
///
/// Resolution tokens map onto a small ordinal scale. Without one, an explicit
/// bitrate is the score. Failing both, the URL's length stands in, since
/// variant URLs that carry more quality metadata tend to be longer. That last
/// signal is weak and kept only for compatibility.
pub fn score(url: &str) -> u64 {
    if let Some(height) = height(url) {
        return height_rank(height);
    }
    bitrate(url).unwrap_or(url.len() as u64)
}

/// Finer signal used to order URLs that share a score: the raw frame height,
/// then the bitrate.
fn detail(url: &str) -> (u64, u64) {
    (height(url).unwrap_or(0), bitrate(url).unwrap_or(0))
}

/// Sorts URLs best first. Within a score, the larger frame or bitrate wins,
/// then the longer URL, then lexical order.
pub fn rank<'a, I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut ranked: Vec<(u64, (u64, u64), &String)> = urls
        .into_iter()
        .map(|url| (score(url), detail(url), url))
        .collect();
    ranked.sort_by(|(a_score, a_detail, a), (b_score, b_detail, b)| {
        b_score
            .cmp(a_score)
            .then_with(|| b_detail.cmp(a_detail))
            .then_with(|| b.len().cmp(&a.len()))
            .then_with(|| a.cmp(b))
    });
    ranked.into_iter().map(|(_, _, url)| url.clone()).collect()
}

fn pick(ranked: Vec<String>, tier: QualityTier) -> Option<String> {
    let index = tier.index(ranked.len())?;
    ranked.into_iter().nth(index)
}

/// Chooses a video URL and, for split streams, an audio URL.
///
/// Complete files beat playlists. A direct-file bucket holding only segments
/// is treated as empty. Without files, a video-tagged stream wins over a plain
/// manifest, and the best audio-tagged stream is paired with it.
pub fn select(candidates: &Candidates, tier: QualityTier) -> Selection {
    let files: Vec<&String> = candidates
        .direct_files
        .iter()
        .filter(|url| !candidates::is_segment(url))
        .collect();
    if !files.is_empty() {
        return Selection {
            video: pick(rank(files), tier),
            audio: None,
        };
    }

    let video = if !candidates.video_streams.is_empty() {
        pick(rank(&candidates.video_streams), tier)
    } else {
        let manifests: Vec<&String> = candidates
            .manifests
            .iter()
            .filter(|url| !candidates::is_audio_tagged(url))
            .collect();
        // A master playlist carries every variant, so quality is chosen later.
        rank(manifests).into_iter().next()
    };

    let audio = video
        .as_ref()
        .and_then(|_| rank(&candidates.audio_streams).into_iter().next());

    Selection { video, audio }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn set(urls: &[&str]) -> BTreeSet<String> {
        urls.iter().map(|url| url.to_string()).collect()
    }

    fn files(urls: &[&str]) -> Candidates {
        Candidates {
            direct_files: set(urls),
            ..Default::default()
        }
    }

    #[test]
    fn highest_picks_the_largest_resolution() {
        let candidates = files(&["a-640x360.mp4", "a-1280x720.mp4"]);
        let selection = select(&candidates, QualityTier::Highest);
        assert_eq!(selection.video.as_deref(), Some("a-1280x720.mp4"));
        assert_eq!(selection.audio, None);
    }

    #[test]
    fn medium_picks_the_middle_entry() {
        let candidates = files(&["a-640x360.mp4", "a-1280x720.mp4", "a-320x180.mp4"]);
        let selection = select(&candidates, QualityTier::Medium);
        assert_eq!(selection.video.as_deref(), Some("a-640x360.mp4"));
    }

    #[test]
    fn extremes_follow_the_score() {
        let urls = [
            "https://video.twimg.com/v/vid/avc1/480x270/a.mp4",
            "https://video.twimg.com/v/vid/avc1/1920x1080/b.mp4",
            "https://video.twimg.com/v/vid/avc1/640x360/c.mp4",
            "https://video.twimg.com/v/vid/avc1/1280x720/d.mp4",
        ];
        let candidates = files(&urls);
        assert_eq!(
            select(&candidates, QualityTier::Highest).video.as_deref(),
            Some(urls[1])
        );
        assert_eq!(
            select(&candidates, QualityTier::High).video.as_deref(),
            Some(urls[3])
        );
        assert_eq!(
            select(&candidates, QualityTier::Low).video.as_deref(),
            Some(urls[2])
        );
        assert_eq!(
            select(&candidates, QualityTier::Lowest).video.as_deref(),
            Some(urls[0])
        );
    }

    #[test]
    fn single_candidate_satisfies_every_tier() {
        let candidates = files(&["only-640x360.mp4"]);
        for name in QualityTier::NAMES {
            let tier: QualityTier = name.parse().unwrap();
            assert_eq!(
                select(&candidates, tier).video.as_deref(),
                Some("only-640x360.mp4"),
                "tier {tier}"
            );
        }
    }

    #[test]
    fn segment_only_files_fall_through_to_manifests() {
        let candidates = Candidates {
            direct_files: set(&[
                "https://video.twimg.com/a/seg1.m4s",
                "https://video.twimg.com/a/seg2.m4s",
            ]),
            manifests: set(&["https://video.twimg.com/a/stream.m3u8"]),
            ..Default::default()
        };
        let selection = select(&candidates, QualityTier::Highest);
        assert_eq!(
            selection.video.as_deref(),
            Some("https://video.twimg.com/a/stream.m3u8")
        );
    }

    #[test]
    fn init_segment_does_not_shadow_the_playlist() {
        let registry = candidates::CandidateRegistry::new();
        for url in [
            "https://video.twimg.com/ext_tw_video/1/pu/pl/master.m3u8",
            "https://video.twimg.com/ext_tw_video/1/pu/pl/avc1/1280x720/v.m3u8",
            "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/0/0/1280x720/init.mp4",
            "https://video.twimg.com/ext_tw_video/1/pu/vid/avc1/0/3000/1280x720/seg.m4s",
        ] {
            registry.record(url, None);
        }

        let selection = select(&registry.snapshot(), QualityTier::Highest);
        assert_eq!(
            selection.video.as_deref(),
            Some("https://video.twimg.com/ext_tw_video/1/pu/pl/avc1/1280x720/v.m3u8")
        );
    }

    #[test]
    fn bare_segment_names_are_excluded_too() {
        let candidates = Candidates {
            direct_files: set(&["seg1.m4s", "seg2.m4s"]),
            manifests: set(&["stream.m3u8"]),
            ..Default::default()
        };
        assert_eq!(
            select(&candidates, QualityTier::Highest).video.as_deref(),
            Some("stream.m3u8")
        );
    }

    #[test]
    fn tagged_streams_are_paired_with_audio() {
        let candidates = Candidates {
            manifests: set(&[
                "https://video.twimg.com/v/pl/master.m3u8",
                "https://video.twimg.com/v/pl/avc1/1280x720/hi.m3u8",
                "https://video.twimg.com/v/pl/avc1/480x270/lo.m3u8",
            ]),
            video_streams: set(&[
                "https://video.twimg.com/v/pl/avc1/1280x720/hi.m3u8",
                "https://video.twimg.com/v/pl/avc1/480x270/lo.m3u8",
            ]),
            audio_streams: set(&[
                "https://video.twimg.com/v/pl/mp4a/64000/a64.m3u8",
                "https://video.twimg.com/v/pl/mp4a/128000/a128.m3u8",
            ]),
            ..Default::default()
        };

        let best = select(&candidates, QualityTier::Highest);
        assert_eq!(
            best.video.as_deref(),
            Some("https://video.twimg.com/v/pl/avc1/1280x720/hi.m3u8")
        );
        assert_eq!(
            best.audio.as_deref(),
            Some("https://video.twimg.com/v/pl/mp4a/128000/a128.m3u8")
        );

        let worst = select(&candidates, QualityTier::Lowest);
        assert_eq!(
            worst.video.as_deref(),
            Some("https://video.twimg.com/v/pl/avc1/480x270/lo.m3u8")
        );
    }

    #[test]
    fn ties_within_a_score_go_to_the_larger_frame() {
        let ranked = rank(&set(&["a-320x180.mp4", "a-480x270.mp4", "a-256x144.mp4"]));
        assert_eq!(ranked, ["a-480x270.mp4", "a-320x180.mp4", "a-256x144.mp4"]);

        let ranked = rank(&set(&[
            "https://video.twimg.com/v/mp4a/64000/a.m3u8",
            "https://video.twimg.com/v/mp4a/128000/b.m3u8",
        ]));
        assert_eq!(ranked[0], "https://video.twimg.com/v/mp4a/128000/b.m3u8");
    }

    #[test]
    fn bitrate_is_used_without_resolution() {
        assert_eq!(score("https://example.com/v.mp4?bitrate=2176000"), 2_176_000);
        assert_eq!(score("https://example.com/clip_720p.mp4"), 4);
        assert_eq!(score("https://example.com/v.mp4"), 25);
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let selection = select(&Candidates::default(), QualityTier::Highest);
        assert!(selection.is_empty());
        assert_eq!(selection.audio, None);
    }

    #[test]
    fn tier_index_degrades_gracefully() {
        assert_eq!(QualityTier::High.index(1), Some(0));
        assert_eq!(QualityTier::Low.index(1), Some(0));
        assert_eq!(QualityTier::Medium.index(4), Some(2));
        assert_eq!(QualityTier::Low.index(4), Some(2));
        assert_eq!(QualityTier::Lowest.index(0), None);
    }
}
