//! Running the transcoder and following its progress.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use log::{debug, trace};
use regex::{Captures, Regex};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::context::SubprocessSlot;
use crate::error::{Error, Result};
use crate::progress::{ProgressSink, SilentProgress, TranscodeProgress};

/// Minimum time between two progress updates.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);
/// Diagnostic lines kept for error reports.
pub const DIAGNOSTIC_TAIL: usize = 20;

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid duration pattern")
});
static POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid position pattern")
});
static SPEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("valid speed pattern"));

fn clock_seconds(caps: &Captures) -> Option<f64> {
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Splits the transcoder's stderr into lines and reads progress out of them.
///
/// Input may arrive in arbitrary fragments. Both `\r` (progress rewrites) and
/// `\n` end a line.
#[derive(Debug, Default)]
pub struct DiagnosticParser {
    pending: Vec<u8>,
    progress: TranscodeProgress,
    tail: VecDeque<String>,
}

impl DiagnosticParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a fragment. Returns whether the progress changed.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.pending.extend_from_slice(chunk);
        let mut changed = false;
        while let Some(end) = self.pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            changed |= self.parse_line(&String::from_utf8_lossy(&line[..end]));
        }
        changed
    }

    /// Parses whatever is left once the stream has ended.
    pub fn finish(&mut self) -> bool {
        let rest = std::mem::take(&mut self.pending);
        self.parse_line(&String::from_utf8_lossy(&rest))
    }

    fn parse_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        trace!("transcoder: {}", line);
        if self.tail.len() == DIAGNOSTIC_TAIL {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        let mut changed = false;
        if let Some(duration) = DURATION.captures(line).as_ref().and_then(clock_seconds) {
            changed |= self.progress.set_duration(duration);
        }
        if let Some(position) = POSITION.captures(line).as_ref().and_then(clock_seconds) {
            changed |= self.progress.set_position(position);
        }
        if let Some(speed) = SPEED
            .captures(line)
            .and_then(|caps| caps[1].parse::<f64>().ok())
        {
            self.progress.set_speed(speed);
            changed = true;
        }
        changed
    }

    pub fn progress(&self) -> &TranscodeProgress {
        &self.progress
    }

    /// The last [`DIAGNOSTIC_TAIL`] lines, oldest first.
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Arguments that remux a single HLS input into MP4.
pub fn remux_args(input: &str, destination: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-bsf:a".to_string(),
        "aac_adtstoasc".to_string(),
        destination.display().to_string(),
    ]
}

/// Arguments that mux separate video and audio inputs into MP4.
///
/// Video is copied, audio re-encoded to AAC, and exactly one stream of each is mapped.
pub fn mux_args(video: &str, audio: &str, destination: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        video.to_string(),
        "-i".to_string(),
        audio.to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        destination.display().to_string(),
    ]
}

/// Launches the transcoder and reports its progress.
#[derive(Clone)]
pub struct TranscodeSupervisor {
    program: PathBuf,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    slot: Option<Arc<SubprocessSlot>>,
}

impl TranscodeSupervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            sink: Arc::new(SilentProgress),
            cancel: CancellationToken::new(),
            slot: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Kills the transcoder once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Registers the running process in `slot` for the interrupt handler.
    pub fn with_slot(mut self, slot: Arc<SubprocessSlot>) -> Self {
        self.slot = Some(slot);
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Runs the transcoder with `args` and waits for it to exit.
    ///
    /// Only the exit code decides success. The process is killed and its slot
    /// released on every path out of this function.
    ///
    /// # Errors
    ///
    /// [`Error::Subprocess`] for a failed launch or a non-zero exit, carrying
    /// the last diagnostic lines, and [`Error::Cancelled`] if interrupted.
    pub async fn run(&self, args: &[String], destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        debug!("Running {} {}", self.program_name(), args.join(" "));
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            command.creation_flags(0x08000000);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.sink.abandon("Transcoder could not be started");
                return Err(Error::Subprocess {
                    program: self.program_name(),
                    code: None,
                    stderr: e.to_string(),
                });
            }
        };
        let _lease = self.slot.as_ref().map(|slot| slot.occupy(child.id()));

        let mut parser = DiagnosticParser::new();
        let result = self.supervise(&mut child, &mut parser).await;
        if result.is_err() {
            if let Err(e) = child.kill().await {
                trace!("Transcoder already exited: {}", e);
            }
        }

        match result {
            Ok(()) => {
                self.sink.transcode(parser.progress());
                self.sink
                    .finish(&format!("Saved {}", destination.display()));
                Ok(())
            }
            Err(Error::Cancelled) => {
                self.sink.abandon("Transcode interrupted");
                Err(Error::Cancelled)
            }
            Err(Error::Subprocess { program, code, .. }) => {
                self.sink.abandon("Transcode failed");
                Err(Error::Subprocess {
                    program,
                    code,
                    stderr: parser.tail(),
                })
            }
            Err(e) => {
                self.sink.abandon("Transcode failed");
                Err(e)
            }
        }
    }

    async fn supervise(&self, child: &mut Child, parser: &mut DiagnosticParser) -> Result<()> {
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Subprocess {
                program: self.program_name(),
                code: None,
                stderr: "stderr was not captured".to_string(),
            })?;

        let mut buffer = [0u8; 4096];
        let mut last_update: Option<Instant> = None;
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                read = stderr.read(&mut buffer) => read?,
            };
            if read == 0 {
                break;
            }
            parser.feed(&buffer[..read]);

            let now = Instant::now();
            if last_update.is_none_or(|at| now.duration_since(at) >= UPDATE_INTERVAL) {
                self.sink.transcode(parser.progress());
                last_update = Some(now);
            }
        }
        parser.finish();

        let status = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            status = child.wait() => status?,
        };
        if status.success() {
            Ok(())
        } else {
            Err(Error::Subprocess {
                program: self.program_name(),
                code: status.code(),
                stderr: String::new(),
            })
        }
    }
}
