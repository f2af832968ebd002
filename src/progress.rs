//! Progress models for transfers and transcodes, and the sinks that show them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};

/// Minimum time between two throughput samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// ETA stays unknown until the transfer has run this long.
pub const ETA_WARMUP: Duration = Duration::from_secs(1);

/// Byte counter of a running transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    downloaded: u64,
    total: Option<u64>,
    started: Instant,
    last_sample: Instant,
    sampled_bytes: u64,
    speed: f64,
    eta: Option<Duration>,
}

impl TransferProgress {
    pub fn new(total: Option<u64>, now: Instant) -> Self {
        Self {
            downloaded: 0,
            total: total.filter(|t| *t > 0),
            started: now,
            last_sample: now,
            sampled_bytes: 0,
            speed: 0.0,
            eta: None,
        }
    }

    /// Counts `bytes` more received at `now`.
    ///
    /// Throughput is resampled once a full slice has elapsed, from the bytes of
    /// that slice alone. Returns whether a new sample was taken.
    pub fn advance(&mut self, bytes: u64, now: Instant) -> bool {
        self.downloaded += bytes;

        let slice = now.saturating_duration_since(self.last_sample);
        if slice < SAMPLE_INTERVAL {
            return false;
        }

        self.speed = (self.downloaded - self.sampled_bytes) as f64 / slice.as_secs_f64();
        self.last_sample = now;
        self.sampled_bytes = self.downloaded;

        let elapsed = now.saturating_duration_since(self.started);
        self.eta = match self.total {
            Some(total) if elapsed > ETA_WARMUP && self.speed > 0.0 => {
                let remaining = total.saturating_sub(self.downloaded) as f64;
                Some(Duration::from_secs_f64(remaining / self.speed))
            }
            _ => None,
        };
        true
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Total size, or `None` when the server never told us.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Bytes per second over the most recent slice.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn eta(&self) -> Option<Duration> {
        self.eta
    }

    pub fn percent(&self) -> Option<f64> {
        self.total
            .map(|total| (self.downloaded as f64 / total as f64 * 100.0).min(100.0))
    }
}

/// Position of a running transcode, in seconds of media.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeProgress {
    duration: Option<f64>,
    position: f64,
    speed: Option<f64>,
}

impl TranscodeProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the duration. Only the first call has any effect.
    pub fn set_duration(&mut self, seconds: f64) -> bool {
        if self.duration.is_some() || seconds <= 0.0 {
            return false;
        }
        self.duration = Some(seconds);
        true
    }

    /// Moves the position forward. Earlier positions are ignored.
    pub fn set_position(&mut self, seconds: f64) -> bool {
        if seconds <= self.position {
            return false;
        }
        self.position = seconds;
        true
    }

    pub fn set_speed(&mut self, multiplier: f64) {
        self.speed = Some(multiplier);
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Multiple of real time the transcoder currently runs at.
    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    pub fn percent(&self) -> Option<f64> {
        self.duration
            .map(|duration| (self.position / duration * 100.0).min(100.0))
    }
}

/// Receives progress from the downloader and the transcode supervisor.
pub trait ProgressSink: Send + Sync {
    fn transfer(&self, progress: &TransferProgress);
    fn transcode(&self, progress: &TranscodeProgress);
    fn finish(&self, message: &str);
    fn abandon(&self, message: &str);
}

/// A sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn transfer(&self, _progress: &TransferProgress) {}
    fn transcode(&self, _progress: &TranscodeProgress) {}
    fn finish(&self, _message: &str) {}
    fn abandon(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarKind {
    Bytes,
    BytesUnknown,
    Seconds,
    Spinner,
}

/// Terminal progress bars drawn with `indicatif`.
pub struct ConsoleProgress {
    multi: MultiProgress,
    bar: Mutex<Option<(BarKind, ProgressBar)>>,
}

impl ConsoleProgress {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bar: Mutex::new(None),
        }
    }

    fn style(kind: BarKind) -> ProgressStyle {
        let template = match kind {
            BarKind::Bytes => {
                "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}"
            }
            BarKind::BytesUnknown => "{spinner:.green} {bytes} {msg}",
            BarKind::Seconds => "{spinner:.green} [{bar:40.cyan/blue}] {percent}% {msg}",
            BarKind::Spinner => "{spinner:.green} {msg}",
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }

    /// Runs `update` on the current bar, replacing it when its kind changes.
    fn with_bar(&self, kind: BarKind, length: Option<u64>, update: impl FnOnce(&ProgressBar)) {
        let mut slot = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        let reuse = matches!(&*slot, Some((current, _)) if *current == kind);
        if !reuse {
            if let Some((_, old)) = slot.take() {
                old.finish_and_clear();
            }
            let bar = match length {
                Some(length) => ProgressBar::new(length),
                None => ProgressBar::new_spinner(),
            };
            let bar = self.multi.add(bar);
            bar.set_style(Self::style(kind));
            *slot = Some((kind, bar));
        }
        if let Some((_, bar)) = slot.as_ref() {
            update(bar);
        }
    }

    fn close(&self, message: &str, abandon: bool) {
        let mut slot = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some((_, bar)) if abandon => bar.abandon_with_message(message.to_string()),
            Some((_, bar)) => bar.finish_with_message(message.to_string()),
            None => {
                let _ = self.multi.println(message);
            }
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn transfer(&self, progress: &TransferProgress) {
        let speed = format!("{}/s", HumanBytes(progress.speed() as u64));
        match progress.total() {
            Some(total) => self.with_bar(BarKind::Bytes, Some(total), |bar| {
                bar.set_length(total);
                bar.set_position(progress.downloaded());
                let eta = progress
                    .eta()
                    .map(|eta| HumanDuration(eta).to_string())
                    .unwrap_or_else(|| "--".to_string());
                bar.set_message(format!("{} ETA {}", speed, eta));
            }),
            None => self.with_bar(BarKind::BytesUnknown, None, |bar| {
                bar.set_position(progress.downloaded());
                bar.set_message(speed);
                bar.tick();
            }),
        }
    }

    fn transcode(&self, progress: &TranscodeProgress) {
        let speed = progress
            .speed()
            .map(|speed| format!("{:.2}x", speed))
            .unwrap_or_default();
        match progress.duration() {
            Some(duration) => self.with_bar(BarKind::Seconds, Some(1000), |bar| {
                bar.set_position((progress.position() / duration * 1000.0).min(1000.0) as u64);
                bar.set_message(format!(
                    "{} / {} {}",
                    format_clock(progress.position()),
                    format_clock(duration),
                    speed
                ));
            }),
            None => self.with_bar(BarKind::Spinner, None, |bar| {
                bar.set_message(format!(
                    "Remuxing {} {}",
                    format_clock(progress.position()),
                    speed
                ));
                bar.tick();
            }),
        }
    }

    fn finish(&self, message: &str) {
        self.close(message, false);
    }

    fn abandon(&self, message: &str) {
        self.close(message, true);
    }
}

/// Formats seconds as `H:MM:SS`.
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
